//! Resync and online-verify request generation.
//!
//! Every time the resync timer fires on a sync target, the generator asks
//! the rate controller how many 4 KiB requests this tick may issue, walks
//! the out-of-sync bitmap from the resume cursor, coalesces adjacent dirty
//! blocks into larger aligned requests and sends them (or, with checksum
//! based resync, reads the local block first). A verify source walks the
//! device linearly instead.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error};

use crate::bitmap::{
    bit_to_sect, sect_to_bit, Sector, BM_BLOCKS_PER_BM_EXT_MASK, BM_BLOCK_SIZE, BM_SECT_PER_BIT,
    SECTOR_SHIFT,
};
use crate::connection::Connection;
use crate::device::Device;
use crate::error::{ReplError, ReplResult};
use crate::peer_request::{PeerAction, PeerRequest};
use crate::state::ConnState;
use crate::transport::{Packet, ID_SYNCER};

/// How a generator pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Rearm the timer for the next tick.
    Requeue,
    /// Nothing left to request.
    Done,
}

impl Connection {
    /// Resync timer work: generate the next batch for this device.
    pub(crate) async fn w_resync_timer(&self, vnr: u32, cancel: bool) -> ReplResult<()> {
        let device = self.device(vnr)?;
        device.resync_work_queued.store(false, Ordering::Release);
        if cancel {
            return Ok(());
        }
        let result = match device.state().conn {
            ConnState::VerifyS => self.make_ov_request(&device),
            ConnState::SyncTarget => self.make_resync_request(&device).await,
            _ => Ok(()),
        };
        match result {
            Err(ReplError::DiskFailure { minor }) => {
                error!("minor {}: resync request generation hit a disk failure", minor);
                Ok(())
            }
            other => other,
        }
    }

    /// Requests the controller allows this tick.
    fn requests_this_tick(&self, device: &Device) -> u64 {
        let sect_in = device.rs_sect_in.swap(0, Ordering::AcqRel);
        let mut guard = device.lock();
        let inner = &mut *guard;
        inner
            .controller
            .number_requests(&inner.disk_conf, self.net_conf.max_buffers, sect_in)
    }

    fn send_buffer_has_room(&self) -> bool {
        match self.transport.send_buffer() {
            Some(usage) => !usage.over_half_full(),
            None => false,
        }
    }

    /// One tick of resync request generation on a sync target.
    pub(crate) async fn make_resync_request(&self, device: &Arc<Device>) -> ReplResult<()> {
        let rs_total = device.lock().rs.rs_total;
        if rs_total == 0 {
            // empty resync
            return self.resync_finished(device).await;
        }
        if !device.has_ldev() {
            error!("minor {}: Disk broke down during resync!", device.minor);
            return Ok(());
        }

        let vnr = device.vnr;
        let bitmap = device.bitmap();
        let bits = bitmap.bits();
        let capacity = device.capacity();
        let (max_bio_size, use_csums) = {
            let inner = device.lock();
            (inner.disk_conf.max_bio_bytes.max(BM_BLOCK_SIZE), inner.rs.use_csums)
        };
        let number = self.requests_this_tick(device);

        let mut i: u64 = 0;
        let mut pass = Pass::Requeue;
        if number > 0 {
            pass = loop {
                if i >= number {
                    let fo = device.lock().rs.bm_resync_fo;
                    break if fo >= bits { Pass::Done } else { Pass::Requeue };
                }
                if !self.send_buffer_has_room() {
                    break Pass::Requeue;
                }

                let mut inner = device.lock();
                let Some(mut bit) = bitmap.find_next(inner.rs.bm_resync_fo) else {
                    inner.rs.bm_resync_fo = bits;
                    return Ok(());
                };
                let sector = bit_to_sect(bit);
                if device.block_io.congested() || !device.try_rs_begin_io(&mut inner, sector) {
                    inner.rs.bm_resync_fo = bit;
                    break Pass::Requeue;
                }
                inner.rs.bm_resync_fo = bit + 1;

                if !bitmap.test_bit(bit) {
                    // cleared since find_next
                    device.rs_complete_io(&mut inner, sector);
                    continue;
                }

                // coalesce adjacent dirty blocks into one aligned request
                let mut size = BM_BLOCK_SIZE;
                let mut align = 1u32;
                let rollback_i = i;
                while i < number {
                    if size + BM_BLOCK_SIZE > max_bio_size {
                        break;
                    }
                    if sector & ((1u64 << (align + 3)) - 1) != 0 {
                        break;
                    }
                    // never cross a resync extent
                    if (bit + 1) & BM_BLOCKS_PER_BM_EXT_MASK == 0 {
                        break;
                    }
                    if !bitmap.test_bit(bit + 1) {
                        break;
                    }
                    bit += 1;
                    size += BM_BLOCK_SIZE;
                    if (BM_BLOCK_SIZE << align) <= size {
                        align += 1;
                    }
                    i += 1;
                }
                if size > BM_BLOCK_SIZE {
                    inner.rs.bm_resync_fo = bit + 1;
                }
                if sector + (size as u64 >> SECTOR_SHIFT) > capacity {
                    size = ((capacity - sector) << SECTOR_SHIFT) as u32;
                }
                drop(inner);

                if use_csums {
                    match self.read_for_csum(device, sector, size) {
                        Ok(()) => {}
                        Err(e) if e.is_transient() => {
                            debug!("minor {}: csum read deferred: {}", device.minor, e);
                            let mut inner = device.lock();
                            device.rs_complete_io(&mut inner, sector);
                            inner.rs.bm_resync_fo = sect_to_bit(sector);
                            i = rollback_i;
                            break Pass::Requeue;
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    device.inc_rs_pending();
                    if let Err(e) = self.transport.send(Packet::RsDataRequest {
                        vnr,
                        sector,
                        size,
                        block_id: ID_SYNCER,
                    }) {
                        device.dec_rs_pending();
                        return Err(e);
                    }
                }
                i += 1;
            };
        }

        if pass == Pass::Done {
            // the last replies finish the resync
            return Ok(());
        }
        device.lock().controller.add_in_flight(i << 3);
        device.arm_resync_timer();
        Ok(())
    }

    /// One tick of online verify request generation on a verify source.
    pub(crate) fn make_ov_request(&self, device: &Device) -> ReplResult<()> {
        let vnr = device.vnr;
        let capacity = device.capacity();
        let number = self.requests_this_tick(device);
        let (mut sector, stop) = {
            let inner = device.lock();
            (inner.rs.ov_position, inner.rs.ov_stop_sector)
        };

        let mut i: u64 = 0;
        let mut stop_sector_reached = false;
        let mut requeue_at: Option<Sector> = None;
        while i < number {
            if sector >= capacity {
                return Ok(());
            }
            // at least one request goes out; the reply path checks for done
            stop_sector_reached = i > 0 && stop.is_some_and(|stop| sector >= stop);
            if stop_sector_reached {
                break;
            }
            let mut size = BM_BLOCK_SIZE;
            {
                let mut inner = device.lock();
                if device.block_io.congested() || !device.try_rs_begin_io(&mut inner, sector) {
                    requeue_at = Some(sector);
                    break;
                }
            }
            if sector + (size as u64 >> SECTOR_SHIFT) > capacity {
                size = ((capacity - sector) << SECTOR_SHIFT) as u32;
            }
            device.inc_rs_pending();
            if let Err(e) = self.transport.send(Packet::OvRequest {
                vnr,
                sector,
                size,
                stop,
            }) {
                device.dec_rs_pending();
                return Err(e);
            }
            sector += BM_SECT_PER_BIT;
            i += 1;
        }

        let mut inner = device.lock();
        inner.rs.ov_position = requeue_at.unwrap_or(sector);
        inner.controller.add_in_flight(i << 3);
        drop(inner);
        if i == 0 || !stop_sector_reached {
            device.arm_resync_timer();
        }
        Ok(())
    }

    /// Read a block locally so its checksum can be sent to the sync
    /// source. Transient failures ask the caller to retry next tick.
    pub(crate) fn read_for_csum(&self, device: &Device, sector: Sector, size: u32) -> ReplResult<()> {
        if !device.has_ldev() {
            return Err(ReplError::DiskFailure { minor: device.minor });
        }
        if device.block_io.congested() {
            return Err(ReplError::ResourceExhausted {
                what: "backing device congested",
            });
        }
        let req = PeerRequest::read(sector, size, ID_SYNCER, PeerAction::SendCsum);
        let handle = self.insert_peer_request(device, req)?;
        if let Err(e) = self.submit_peer_io(device, handle) {
            device.lock().peer_reqs.remove(handle);
            debug!("minor {}: csum read not submitted: {}", device.minor, e);
            return Err(ReplError::ResourceExhausted {
                what: "block I/O submission",
            });
        }
        Ok(())
    }
}
