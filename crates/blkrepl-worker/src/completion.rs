//! Block-layer completion handling.
//!
//! Completions of local requests update the request state machine and
//! finish the application I/O; completions of peer requests are turned into
//! acks (writes, via the ack path) or queued for the sender (reads). I/O
//! errors are classified and applied to the disk state per the configured
//! error policy.

use bytes::Bytes;
use tracing::{error, warn};

use crate::block_io::{IoCompletion, IoDir, IoToken};
use crate::config::IoErrorPolicy;
use crate::connection::Connection;
use crate::device::{Device, MD_SYNC};
use crate::error::{ReplError, ReplResult};
use crate::hook::HelperEvent;
use crate::peer_request::{
    PeerAction, PeerReqHandle, PeerRequest, EE_CALL_AL_COMPLETE_IO, EE_SEND_WRITE_ACK,
    EE_WAS_ERROR,
};
use crate::ratelimited;
use crate::request::{
    ReqEvent, ReqHandle, RQ_LOCAL_ABORTED, RQ_LOCAL_COMPLETED, RQ_LOCAL_PENDING, RQ_READA,
};
use crate::state::{ConnState, DiskState};
use crate::transport::{Packet, ID_SYNCER};
use crate::work::WorkItem;

impl Connection {
    /// Route a block-layer completion to its request.
    pub fn io_complete(&self, completion: IoCompletion) -> ReplResult<()> {
        match completion.token {
            IoToken::Local { vnr, req } => {
                let device = self.device(vnr)?;
                self.request_endio(&device, req, completion.result)
            }
            IoToken::Peer { vnr, req } => {
                let device = self.device(vnr)?;
                self.peer_request_endio(&device, req, completion.result)
            }
        }
    }

    /// Local I/O of an application request completed.
    ///
    /// A successful completion of a request that was aborted earlier means
    /// the backing device wrote into (or read from) pages the application
    /// may already have reused. The device is marked fatal and refuses all
    /// further I/O.
    pub(crate) fn request_endio(
        &self,
        device: &Device,
        handle: ReqHandle,
        result: std::io::Result<Bytes>,
    ) -> ReplResult<()> {
        let mut inner = device.lock();
        let Some(req) = inner.requests.get_mut(handle) else {
            warn!("minor {}: completion for unknown local request", device.minor);
            return Err(ReplError::StaleHandle);
        };

        if req.has(RQ_LOCAL_ABORTED) {
            ratelimited!(
                device.io_limiter,
                error,
                "minor {}: delayed completion of aborted local request; disk-timeout may be too aggressive",
                device.minor
            );
            if result.is_ok() {
                let sector = req.sector;
                req.modify(RQ_LOCAL_PENDING, RQ_LOCAL_COMPLETED);
                self.req_settle(device, &mut inner, handle);
                drop(inner);
                device.mark_fatal();
                error!(
                    "minor {}: aborted request at sector {} completed successfully; refusing further I/O",
                    device.minor, sector
                );
                return Err(ReplError::CorruptionHazard {
                    minor: device.minor,
                    sector,
                });
            }
        }

        let event = match (&result, req.is_write(), req.has(RQ_READA)) {
            (Ok(_), _, _) => ReqEvent::CompletedOk,
            (Err(_), true, _) => ReqEvent::WriteCompletedWithError,
            (Err(_), false, true) => ReqEvent::ReadAheadCompletedWithError,
            (Err(_), false, false) => ReqEvent::ReadCompletedWithError,
        };
        if let Ok(data) = &result {
            if !req.is_write() {
                req.data = Some(data.clone());
            }
        }
        req.apply(event);
        let (sector, size) = (req.sector, req.size);

        let retry = event == ReqEvent::ReadCompletedWithError
            && inner.state.pdsk == DiskState::UpToDate
            && self.cstate() >= ConnState::Connected;
        if retry {
            if let Some(req) = inner.requests.get_mut(handle) {
                req.apply(ReqEvent::RetryReadFromPeer);
            }
        }
        self.req_settle(device, &mut inner, handle);
        drop(inner);

        match (event, &result) {
            (ReqEvent::WriteCompletedWithError, Err(e)) => {
                ratelimited!(
                    device.io_limiter,
                    error,
                    "minor {}: local write error {} at sector {}",
                    device.minor,
                    e,
                    sector
                );
                self.chk_io_error(device, IoDir::Write);
            }
            (ReqEvent::ReadCompletedWithError, Err(e)) => {
                ratelimited!(
                    device.io_limiter,
                    error,
                    "minor {}: local read error {} at sector {}",
                    device.minor,
                    e,
                    sector
                );
                device.set_out_of_sync(sector, size);
                self.chk_io_error(device, IoDir::Read);
            }
            (ReqEvent::ReadAheadCompletedWithError, _) => {
                device.set_out_of_sync(sector, size);
            }
            _ => {}
        }
        if retry {
            self.requeue_peer_read(device, handle);
        }
        Ok(())
    }

    /// Apply the configured reaction to a local I/O error.
    pub(crate) fn chk_io_error(&self, device: &Device, dir: IoDir) {
        let what = if dir == IoDir::Write { "write" } else { "read" };
        let mut inner = device.lock();
        let policy = inner.disk_conf.on_io_error;
        match policy {
            IoErrorPolicy::PassOn => {
                ratelimited!(device.io_limiter, error, "minor {}: Local IO failed in {}.", device.minor, what);
                if inner.state.disk > DiskState::Inconsistent {
                    device.update_state_locked(&mut inner, |s| s.disk = DiskState::Inconsistent);
                }
            }
            IoErrorPolicy::Detach | IoErrorPolicy::CallHelper => {
                inner.was_io_error = true;
                let failed = inner.state.disk > DiskState::Failed;
                if failed {
                    device.update_state_locked(&mut inner, |s| s.disk = DiskState::Failed);
                    error!("minor {}: Local IO failed in {}. Detaching...", device.minor, what);
                }
                drop(inner);
                device.post_work(MD_SYNC);
                self.work.signal_device_work();
                if failed && policy == IoErrorPolicy::CallHelper {
                    device.hook.call(device.minor, HelperEvent::LocalIoError);
                }
            }
        }
    }

    /// Local I/O of a peer request completed.
    pub(crate) fn peer_request_endio(
        &self,
        device: &Device,
        handle: PeerReqHandle,
        result: std::io::Result<Bytes>,
    ) -> ReplResult<()> {
        let mut inner = device.lock();
        let Some(req) = inner.peer_reqs.get_mut(handle) else {
            warn!("minor {}: completion for unknown peer request", device.minor);
            return Err(ReplError::StaleHandle);
        };
        match result {
            Ok(data) => {
                if req.dir != IoDir::Write {
                    req.pages = Some(data);
                }
            }
            Err(e) => {
                req.flags |= EE_WAS_ERROR;
                ratelimited!(
                    device.io_limiter,
                    warn,
                    "minor {}: {} error on peer request, sector {}: {}",
                    device.minor,
                    if req.dir == IoDir::Write { "write" } else { "read" },
                    req.sector,
                    e
                );
            }
        }
        req.pending_bios = req.pending_bios.saturating_sub(1);
        if req.pending_bios > 0 {
            return Ok(());
        }

        let (sector, size, flags) = (req.sector, req.size, req.flags);
        let was_error = req.was_error();
        if req.dir == IoDir::Write {
            let syncer = req.is_syncer();
            inner.done_ee.push(handle);
            if syncer {
                device.rs_complete_io(&mut inner, sector);
            }
            if flags & EE_CALL_AL_COMPLETE_IO != 0 {
                device.al_complete_io(&mut inner, sector);
            }
            drop(inner);
            device.add_written_kib(size as u64 >> 10);
            if was_error {
                self.chk_io_error(device, IoDir::Write);
            }
            self.asender_wake.notify_one();
        } else {
            drop(inner);
            device.add_read_kib(size as u64 >> 10);
            if was_error {
                self.chk_io_error(device, IoDir::Read);
            }
            self.work.push(WorkItem::PeerReq {
                vnr: device.vnr,
                req: handle,
            });
        }
        Ok(())
    }

    /// Ack completed peer writes (the ack path). Every completed request is
    /// finished even if a send fails; the first error is returned.
    pub(crate) fn process_done_ee(&self) -> ReplResult<()> {
        let mut first_err = None;
        for device in self.devices() {
            let done: Vec<PeerRequest> = {
                let mut inner = device.lock();
                let handles = std::mem::take(&mut inner.done_ee);
                handles
                    .into_iter()
                    .filter_map(|h| inner.peer_reqs.remove(h))
                    .collect()
            };
            for req in done {
                if let Err(e) = self.e_end_write(&device, req) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn e_end_write(&self, device: &Device, req: PeerRequest) -> ReplResult<()> {
        let vnr = device.vnr;
        let (sector, size) = (req.sector, req.size);
        let result = match req.action {
            PeerAction::RsWriteAck => {
                if !req.was_error() {
                    if device.set_in_sync(sector, size) {
                        self.work.signal_device_work();
                    }
                    self.transport.send(Packet::RsWriteAck { vnr, sector, size })
                } else {
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
            }
            PeerAction::WriteAck => {
                let ack = if req.flags & EE_SEND_WRITE_ACK == 0 {
                    Ok(())
                } else if !req.was_error() {
                    self.transport.send(Packet::WriteAck {
                        vnr,
                        sector,
                        size,
                        block_id: req.block_id,
                    })
                } else {
                    self.transport.send(Packet::NegAck {
                        vnr,
                        sector,
                        size,
                        block_id: req.block_id,
                    })
                };
                ack.and_then(|()| self.mirrored_write_done())
            }
            other => {
                warn!("minor {}: {:?} on the ack path", device.minor, other);
                Ok(())
            }
        };
        device.dec_unacked();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;
    use crate::config::{DiskConf, NetConf};
    use crate::connection::tests::test_node;

    fn conf(policy: IoErrorPolicy) -> DiskConf {
        DiskConf {
            on_io_error: policy,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_read_error_retried_from_peer() {
        let n = test_node(16, conf(IoErrorPolicy::PassOn), NetConf::default());
        n.disk.fail_sector(0);
        let rx = n.conn.submit_read(0, 0, 4096).unwrap();
        n.complete_io();
        // disk degraded, block marked, retry queued
        assert_eq!(n.device.state().disk, DiskState::Inconsistent);
        assert!(n.bitmap.test_bit(0));
        n.conn.run_pending().await.unwrap();
        let sent = n.transport.take_sent();
        let Packet::DataRequest { block_id, .. } = sent[0] else {
            panic!("expected a data request, got {:?}", sent[0]);
        };
        n.conn
            .receive(Packet::DataReply {
                vnr: 0,
                sector: 0,
                block_id,
                data: Bytes::from(vec![4u8; 4096]),
            })
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap()[0], 4);
    }

    #[tokio::test]
    async fn test_read_ahead_error_not_retried() {
        let n = test_node(16, conf(IoErrorPolicy::PassOn), NetConf::default());
        n.disk.fail_sector(0);
        let rx = n.conn.submit_read_ahead(0, 0, 4096).unwrap();
        n.complete_io();
        assert!(rx.await.unwrap().is_err());
        assert!(n.conn.work.is_empty());
        // read-ahead failures do not touch the disk state
        assert_eq!(n.device.state().disk, DiskState::UpToDate);
    }

    #[tokio::test]
    async fn test_write_error_detaches() {
        let n = test_node(16, conf(IoErrorPolicy::Detach), NetConf::default());
        n.disk.fail_sector(8);
        let _rx = n.conn.submit_write(0, 8, Bytes::from(vec![1u8; 4096])).unwrap();
        n.complete_io();
        assert_eq!(n.device.state().disk, DiskState::Failed);
        assert!(n.device.lock().was_io_error);
        assert!(n.conn.work.device_work_pending());
        assert_eq!(n.hook.count(HelperEvent::LocalIoError), 0);
        n.conn.run_pending().await.unwrap();
        assert!(n.metadata.sync_count() > 0);
    }

    #[tokio::test]
    async fn test_call_helper_runs_hook_once() {
        let n = test_node(16, conf(IoErrorPolicy::CallHelper), NetConf::default());
        n.disk.fail_sector(0);
        n.disk.fail_sector(8);
        let _a = n.conn.submit_write(0, 0, Bytes::from(vec![1u8; 4096])).unwrap();
        let _b = n.conn.submit_write(0, 8, Bytes::from(vec![1u8; 4096])).unwrap();
        n.complete_io();
        assert_eq!(n.device.state().disk, DiskState::Failed);
        assert_eq!(n.hook.count(HelperEvent::LocalIoError), 1);
    }

    #[tokio::test]
    async fn test_peer_write_acked_after_completion() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.conn
            .receive(Packet::Data {
                vnr: 0,
                sector: 8,
                block_id: 77,
                data: Bytes::from(vec![2u8; 4096]),
            })
            .unwrap();
        assert_eq!(n.device.unacked(), 1);
        n.conn.process_done_ee().unwrap();
        assert!(n.transport.take_sent().is_empty());
        n.complete_io();
        n.conn.process_done_ee().unwrap();
        assert_eq!(
            n.transport.take_sent(),
            vec![Packet::WriteAck {
                vnr: 0,
                sector: 8,
                size: 4096,
                block_id: 77
            }]
        );
        assert_eq!(n.device.unacked(), 0);
        assert!(n.device.lock().peer_reqs.is_empty());
        assert!(n.device.lock().al_active.is_empty());
    }

    #[tokio::test]
    async fn test_peer_write_error_nacked() {
        let n = test_node(16, conf(IoErrorPolicy::PassOn), NetConf::default());
        n.disk.fail_sector(0);
        n.conn
            .receive(Packet::Data {
                vnr: 0,
                sector: 0,
                block_id: 5,
                data: Bytes::from(vec![2u8; 4096]),
            })
            .unwrap();
        n.complete_io();
        n.conn.process_done_ee().unwrap();
        assert!(matches!(
            n.transport.take_sent()[0],
            Packet::NegAck { block_id: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_send_failure_still_finishes_every_write() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.device.update_state(|s| {
            s.conn = ConnState::SyncTarget;
            s.disk = DiskState::Inconsistent;
        });
        n.bitmap.set_bits(1, 2);
        for sector in [8u64, 16] {
            {
                let mut inner = n.device.lock();
                n.device.rs_begin_io(&mut inner, sector);
            }
            n.device.inc_rs_pending();
            n.conn
                .receive(Packet::RsDataReply {
                    vnr: 0,
                    sector,
                    block_id: ID_SYNCER,
                    data: Bytes::from(vec![4u8; 4096]),
                })
                .unwrap();
        }
        n.complete_io();
        n.transport.take_sent();
        n.transport.fail_next_sends(1);

        assert!(n.conn.process_done_ee().is_err());
        assert!(!n.bitmap.test_bit(1));
        assert!(!n.bitmap.test_bit(2));
        assert_eq!(n.device.unacked(), 0);
        assert!(n.device.lock().peer_reqs.is_empty());
        assert!(matches!(
            n.transport.take_sent().as_slice(),
            [Packet::RsWriteAck { sector: 16, .. }]
        ));
    }

    #[test]
    fn test_stale_completion() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        let err = n
            .conn
            .io_complete(IoCompletion {
                token: IoToken::Local {
                    vnr: 0,
                    req: crate::arena::Handle::from_raw(42),
                },
                result: Ok(Bytes::new()),
            })
            .unwrap_err();
        assert!(matches!(err, ReplError::StaleHandle));
    }
}
