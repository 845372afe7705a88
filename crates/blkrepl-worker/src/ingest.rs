//! Packets from the peer.
//!
//! [`Connection::receive`] is called by the receiving side of the transport
//! for every decoded packet. Requests from the peer become peer requests
//! whose completion is answered by the sender or the ack path; answers to
//! our own requests update local requests, the resync bookkeeping and the
//! rate controller.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bitmap::{sect_to_bit, Sector, BM_BLOCK_SHIFT, BM_SECT_PER_BIT, SECTOR_SHIFT};
use crate::connection::Connection;
use crate::device::Device;
use crate::error::{ReplError, ReplResult};
use crate::peer_request::{PeerAction, PeerRequest, EE_CALL_AL_COMPLETE_IO, EE_SEND_WRITE_ACK};
use crate::ratelimited;
use crate::reply::{ov_out_of_sync_found, ov_out_of_sync_print};
use crate::request::{ReqEvent, ReqHandle};
use crate::state::{ConnState, DiskState};
use crate::transport::{Packet, ID_IN_SYNC, ID_OUT_OF_SYNC, ID_SYNCER};
use crate::work::WorkItem;

/// Largest request the peer may send, in bytes.
const MAX_REQUEST_SIZE: u32 = 1 << 20;

/// Receive-side epoch accounting.
///
/// A barrier closes the peer's current epoch. It is acknowledged with the
/// number of writes that epoch carried, once no received write is still
/// being written locally.
#[derive(Debug, Default)]
pub(crate) struct ReceiveEpoch {
    writes: u32,
    active: u32,
    pending_acks: VecDeque<(u32, u32)>,
}

impl ReceiveEpoch {
    /// A data block of the current epoch arrived.
    pub(crate) fn data_received(&mut self) {
        self.writes += 1;
        self.active += 1;
    }

    /// The peer closed an epoch. Returns the acks that may be sent now.
    pub(crate) fn barrier_received(&mut self, barrier: u32) -> Vec<(u32, u32)> {
        self.pending_acks.push_back((barrier, self.writes));
        self.writes = 0;
        self.drain()
    }

    /// A received write finished locally. Returns the acks that may be sent
    /// now.
    pub(crate) fn write_done(&mut self) -> Vec<(u32, u32)> {
        self.active = self.active.saturating_sub(1);
        self.drain()
    }

    fn drain(&mut self) -> Vec<(u32, u32)> {
        if self.active > 0 {
            return Vec::new();
        }
        self.pending_acks.drain(..).collect()
    }
}

impl Connection {
    /// A mirrored write of the peer was acked; send barrier acks that
    /// became due.
    pub(crate) fn mirrored_write_done(&self) -> ReplResult<()> {
        let acks = self.rcv.lock().write_done();
        self.send_barrier_acks(acks)
    }

    fn send_barrier_acks(&self, acks: Vec<(u32, u32)>) -> ReplResult<()> {
        for (barrier, set_size) in acks {
            debug!("acking barrier {} ({} writes)", barrier, set_size);
            self.transport.send(Packet::BarrierAck { barrier, set_size })?;
        }
        Ok(())
    }

    /// Handle one packet from the peer.
    pub fn receive(&self, packet: Packet) -> ReplResult<()> {
        match packet {
            Packet::Barrier { barrier } => {
                let acks = self.rcv.lock().barrier_received(barrier);
                self.send_barrier_acks(acks)
            }
            Packet::BarrierAck { barrier, set_size } => {
                let acked = self.send.lock().barrier_acked(barrier, set_size);
                if let Err(e) = acked {
                    self.protocol_error(&e);
                    return Err(e);
                }
                Ok(())
            }
            Packet::Data {
                vnr,
                sector,
                block_id,
                data,
            } => self.receive_data(vnr, sector, block_id, data),
            Packet::OutOfSync { vnr, sector, size } => {
                let device = self.device(vnr)?;
                let conn = device.state().conn;
                if !matches!(
                    conn,
                    ConnState::WfSyncUuid | ConnState::WfBitmapT | ConnState::Behind
                ) {
                    warn!(
                        "minor {}: out-of-sync notice in {}, expected WFSyncUUID|WFBitmapT|Behind",
                        device.minor, conn
                    );
                }
                device.set_out_of_sync(sector, size);
                Ok(())
            }
            Packet::DataRequest {
                vnr,
                sector,
                size,
                block_id,
            } => {
                let device = self.device(vnr)?;
                check_range(&device, sector, size)?;
                if device.state().disk != DiskState::UpToDate {
                    ratelimited!(
                        self.limiter,
                        error,
                        "minor {}: Can not satisfy peer's read request, no local data.",
                        device.minor
                    );
                    return self.transport.send(Packet::NegDReply {
                        vnr,
                        sector,
                        size,
                        block_id,
                    });
                }
                let req = PeerRequest::read(sector, size, block_id, PeerAction::EndDataReq);
                self.serve_read(&device, req, false)
            }
            Packet::RsDataRequest {
                vnr, sector, size, ..
            } => {
                let device = self.device(vnr)?;
                check_range(&device, sector, size)?;
                if device.state().disk != DiskState::UpToDate {
                    return self.neg_rs_dreply(&device, sector, size);
                }
                let req = PeerRequest::read(sector, size, ID_SYNCER, PeerAction::EndRsDataReq);
                self.serve_read(&device, req, true)
            }
            Packet::CsumRsRequest {
                vnr,
                sector,
                size,
                digest,
            } => {
                let device = self.device(vnr)?;
                check_range(&device, sector, size)?;
                if self.csums.is_none() {
                    return Err(ReplError::ProtocolViolation {
                        msg: String::from("checksum request without csums-alg"),
                    });
                }
                if device.state().disk != DiskState::UpToDate {
                    return self.neg_rs_dreply(&device, sector, size);
                }
                device.lock().rs.use_csums = true;
                let req = PeerRequest::read(sector, size, ID_SYNCER, PeerAction::EndCsumRsReq)
                    .with_digest(digest);
                self.serve_read(&device, req, true)
            }
            Packet::OvRequest {
                vnr,
                sector,
                size,
                stop,
            } => {
                let device = self.device(vnr)?;
                check_range(&device, sector, size)?;
                if self.verify.is_none() {
                    return Err(ReplError::ProtocolViolation {
                        msg: String::from("verify request without verify-alg"),
                    });
                }
                if device.state().disk != DiskState::UpToDate {
                    return self.neg_rs_dreply(&device, sector, size);
                }
                {
                    let mut inner = device.lock();
                    if inner.rs.ov_start_pending {
                        let end = match stop {
                            Some(stop) => sect_to_bit(stop + BM_SECT_PER_BIT - 1),
                            None => device.bitmap().bits(),
                        };
                        let left = end
                            .min(device.bitmap().bits())
                            .saturating_sub(sect_to_bit(sector))
                            .max(1);
                        let now = Instant::now();
                        inner.rs.ov_start_pending = false;
                        inner.rs.ov_start_sector = sector;
                        inner.rs.ov_position = sector;
                        inner.rs.ov_stop_sector = stop;
                        inner.rs.ov_left = left;
                        inner.rs.rs_total = left;
                        inner.rs.rs_start = now;
                        inner.rs.last_progress = now;
                        info!("minor {}: Online Verify start sector: {}", device.minor, sector);
                    }
                }
                let req = PeerRequest::read(sector, size, ID_SYNCER, PeerAction::EndOvReq);
                self.serve_read(&device, req, true)
            }
            Packet::OvReply {
                vnr,
                sector,
                size,
                digest,
            } => {
                let device = self.device(vnr)?;
                check_range(&device, sector, size)?;
                device.dec_rs_pending();
                device.add_rs_sect_in(size as u64 >> SECTOR_SHIFT);
                if device.state().disk != DiskState::UpToDate {
                    {
                        let mut inner = device.lock();
                        device.rs_complete_io(&mut inner, sector);
                    }
                    return self.transport.send(Packet::OvResult {
                        vnr,
                        sector,
                        size,
                        block_id: ID_IN_SYNC,
                    });
                }
                let req = PeerRequest::read(sector, size, ID_SYNCER, PeerAction::EndOvReply)
                    .with_digest(digest);
                self.serve_read(&device, req, false)
            }
            Packet::OvResult {
                vnr,
                sector,
                size,
                block_id,
            } => {
                let device = self.device(vnr)?;
                let finished = {
                    let mut inner = device.lock();
                    if block_id == ID_OUT_OF_SYNC {
                        ov_out_of_sync_found(&device, &mut inner, sector, size);
                    } else {
                        ov_out_of_sync_print(&device, &mut inner);
                    }
                    device.rs_complete_io(&mut inner, sector);
                    inner.rs.ov_left = inner.rs.ov_left.saturating_sub(1);
                    let end = sector + (size as u64 >> SECTOR_SHIFT);
                    inner.rs.ov_position = end;
                    let stop_reached = inner.rs.ov_stop_sector.is_some_and(|stop| end >= stop);
                    inner.rs.ov_left == 0 || stop_reached
                };
                device.dec_rs_pending();
                if finished {
                    self.work.push(WorkItem::OvFinished { vnr });
                }
                Ok(())
            }
            Packet::DataReply {
                vnr,
                block_id,
                data,
                ..
            } => {
                let device = self.device(vnr)?;
                let handle = ReqHandle::from_raw(block_id);
                let mut inner = device.lock();
                let Some(req) = inner.requests.get_mut(handle) else {
                    return Err(ReplError::ProtocolViolation {
                        msg: format!("DataReply for unknown request {:#x}", block_id),
                    });
                };
                req.data = Some(data);
                req.apply(ReqEvent::DataReceived);
                self.req_settle(&device, &mut inner, handle);
                Ok(())
            }
            Packet::NegDReply {
                vnr,
                sector,
                size,
                block_id,
            } => {
                let device = self.device(vnr)?;
                ratelimited!(
                    self.limiter,
                    error,
                    "minor {}: Got NegDReply; Sector {}, len {}.",
                    device.minor,
                    sector,
                    size
                );
                self.req_mod(&device, ReqHandle::from_raw(block_id), ReqEvent::NegAcked)
                    .map_err(|_| ReplError::ProtocolViolation {
                        msg: format!("NegDReply for unknown request {:#x}", block_id),
                    })
            }
            Packet::RsDataReply {
                vnr, sector, data, ..
            } => self.receive_rs_data(vnr, sector, data),
            Packet::RsIsInSync { vnr, sector, size } => {
                let device = self.device(vnr)?;
                if device.has_ldev() {
                    {
                        let mut inner = device.lock();
                        device.rs_complete_io(&mut inner, sector);
                    }
                    if device.set_in_sync(sector, size) {
                        self.work.signal_device_work();
                    }
                    device.lock().rs.rs_same_csum += (size >> BM_BLOCK_SHIFT) as u64;
                }
                device.dec_rs_pending();
                device.add_rs_sect_in(size as u64 >> SECTOR_SHIFT);
                Ok(())
            }
            Packet::NegRsDReply { vnr, sector, size } => self.resync_not_served(vnr, sector, size, true),
            Packet::RsCancel { vnr, sector, size } => self.resync_not_served(vnr, sector, size, false),
            Packet::RsWriteAck { vnr, sector, size } => {
                let device = self.device(vnr)?;
                if device.set_in_sync(sector, size) {
                    self.work.signal_device_work();
                }
                device.dec_rs_pending();
                Ok(())
            }
            Packet::WriteAck { vnr, block_id, .. } => {
                let device = self.device(vnr)?;
                self.req_mod(&device, ReqHandle::from_raw(block_id), ReqEvent::WriteAckedByPeer)
                    .map_err(|_| ReplError::ProtocolViolation {
                        msg: format!("WriteAck for unknown request {:#x}", block_id),
                    })
            }
            Packet::NegAck {
                vnr,
                sector,
                size,
                block_id,
            } => {
                let device = self.device(vnr)?;
                if block_id == ID_SYNCER {
                    device.dec_rs_pending();
                    if device.rs_failed_io(sector, size) {
                        self.work.signal_device_work();
                    }
                    return Ok(());
                }
                if self
                    .req_mod(&device, ReqHandle::from_raw(block_id), ReqEvent::NegAcked)
                    .is_err()
                {
                    // request already gone; the block still differs on the peer
                    device.set_out_of_sync(sector, size);
                }
                Ok(())
            }
            Packet::Ping => self.transport.send(Packet::PingAck),
            Packet::PingAck => Ok(()),
        }
    }

    /// The peer did not send a block we asked for. `failed` counts it as a
    /// resync failure; a cancel only releases the request.
    fn resync_not_served(&self, vnr: u32, sector: Sector, size: u32, failed: bool) -> ReplResult<()> {
        let device = self.device(vnr)?;
        device.dec_rs_pending();
        if device.has_ldev() {
            {
                let mut inner = device.lock();
                device.rs_complete_io(&mut inner, sector);
            }
            if failed && device.rs_failed_io(sector, size) {
                self.work.signal_device_work();
            }
        }
        device.add_rs_sect_in(size as u64 >> SECTOR_SHIFT);
        Ok(())
    }

    fn receive_data(&self, vnr: u32, sector: Sector, block_id: u64, data: Bytes) -> ReplResult<()> {
        let device = self.device(vnr)?;
        let size = data.len() as u32;
        check_range(&device, sector, size)?;
        self.rcv.lock().data_received();

        if device.has_ldev() {
            let mut req = PeerRequest::write(sector, data, block_id, PeerAction::WriteAck);
            req.flags |= EE_CALL_AL_COMPLETE_IO | EE_SEND_WRITE_ACK;
            {
                let mut inner = device.lock();
                device.al_begin_io(&mut inner, sector);
            }
            device.inc_unacked();
            match self.submit_peer_request(&device, req) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    ratelimited!(
                        self.limiter,
                        warn,
                        "minor {}: cannot queue peer write: {}",
                        device.minor,
                        e
                    );
                    let mut inner = device.lock();
                    device.al_complete_io(&mut inner, sector);
                    drop(inner);
                    device.dec_unacked();
                }
                Err(e) => return Err(e),
            }
        } else {
            ratelimited!(
                self.limiter,
                error,
                "minor {}: Can not write mirrored data block to local disk.",
                device.minor
            );
        }
        device.set_out_of_sync(sector, size);
        self.transport.send(Packet::NegAck {
            vnr,
            sector,
            size,
            block_id,
        })?;
        self.mirrored_write_done()
    }

    fn receive_rs_data(&self, vnr: u32, sector: Sector, data: Bytes) -> ReplResult<()> {
        let device = self.device(vnr)?;
        let size = data.len() as u32;
        check_range(&device, sector, size)?;
        device.dec_rs_pending();
        device.add_rs_sect_in(size as u64 >> SECTOR_SHIFT);

        if device.has_ldev() {
            device.inc_unacked();
            let req = PeerRequest::write(sector, data, ID_SYNCER, PeerAction::RsWriteAck);
            match self.submit_peer_request(&device, req) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => device.dec_unacked(),
                Err(e) => {
                    device.dec_unacked();
                    return Err(e);
                }
            }
        } else {
            ratelimited!(
                self.limiter,
                error,
                "minor {}: Can not write resync data to local disk.",
                device.minor
            );
        }
        {
            let mut inner = device.lock();
            device.rs_complete_io(&mut inner, sector);
        }
        if device.rs_failed_io(sector, size) {
            self.work.signal_device_work();
        }
        self.transport.send(Packet::NegAck {
            vnr,
            sector,
            size,
            block_id: ID_SYNCER,
        })
    }

    /// Read a block for the peer. `resync` requests hold a resync
    /// reservation on their extent until answered.
    fn serve_read(&self, device: &Device, req: PeerRequest, resync: bool) -> ReplResult<()> {
        let sector = req.sector;
        if resync {
            let mut inner = device.lock();
            device.rs_begin_io(&mut inner, sector);
        }
        device.inc_unacked();
        if let Err(e) = self.submit_peer_request(device, req) {
            if resync {
                let mut inner = device.lock();
                device.rs_complete_io(&mut inner, sector);
            }
            device.dec_unacked();
            return Err(e);
        }
        Ok(())
    }

    fn neg_rs_dreply(&self, device: &Device, sector: Sector, size: u32) -> ReplResult<()> {
        ratelimited!(
            self.limiter,
            error,
            "minor {}: Can not satisfy peer's resync request, no local data.",
            device.minor
        );
        self.transport.send(Packet::NegRsDReply {
            vnr: device.vnr,
            sector,
            size,
        })
    }

    /// The peer broke the protocol: drop to ProtocolError.
    fn protocol_error(&self, err: &ReplError) {
        error!("conn: {}", err);
        self.set_cstate(ConnState::ProtocolError);
        for device in self.devices() {
            device.update_state(|s| {
                s.conn = ConnState::ProtocolError;
                s.pdsk = DiskState::DUnknown;
                s.peer_isp = false;
            });
        }
        self.graph.sweep();
    }
}

fn check_range(device: &Device, sector: Sector, size: u32) -> ReplResult<()> {
    if size == 0 || size % 512 != 0 || size > MAX_REQUEST_SIZE {
        return Err(ReplError::ProtocolViolation {
            msg: format!("minor {}: invalid request size {}", device.minor, size),
        });
    }
    if sector + (size as u64 >> SECTOR_SHIFT) > device.capacity() {
        return Err(ReplError::ProtocolViolation {
            msg: format!(
                "minor {}: request {}+{} beyond end of device",
                device.minor, sector, size
            ),
        });
    }
    Ok(())
}
