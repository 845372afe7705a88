//! Sender-side actions for peer requests whose local read completed.
//!
//! Each action answers the peer: data or a negative reply for reads, full
//! data or an in-sync ack after comparing checksums, a digest for verify
//! requests, and a verify result after comparing digests. The peer request
//! is released before the answer goes out.

use tracing::{error, info, warn};

use crate::bitmap::{Sector, BM_BLOCK_SHIFT, SECTOR_SHIFT};
use crate::connection::Connection;
use crate::device::{Device, DeviceInner};
use crate::error::{ReplError, ReplResult};
use crate::peer_request::{PeerAction, PeerReqHandle, PeerRequest};
use crate::ratelimited;
use crate::state::{ConnState, DiskState};
use crate::transport::{Packet, ID_IN_SYNC, ID_OUT_OF_SYNC, ID_SYNCER};
use crate::work::WorkItem;

/// Record an out-of-sync verify result, merging it into the current run.
pub(crate) fn ov_out_of_sync_found(device: &Device, inner: &mut DeviceInner, sector: Sector, size: u32) {
    let sectors = size as u64 >> SECTOR_SHIFT;
    if inner.rs.ov_last_oos_start + inner.rs.ov_last_oos_size == sector {
        inner.rs.ov_last_oos_size += sectors;
    } else {
        inner.rs.ov_last_oos_start = sector;
        inner.rs.ov_last_oos_size = sectors;
    }
    inner.rs.ov_oos_found += 1;
    device.set_out_of_sync(sector, size);
}

/// Report and close the current out-of-sync run, if any.
pub(crate) fn ov_out_of_sync_print(device: &Device, inner: &mut DeviceInner) {
    if inner.rs.ov_last_oos_size > 0 {
        error!(
            "minor {}: Out of sync: start={}, size={} (sectors)",
            device.minor, inner.rs.ov_last_oos_start, inner.rs.ov_last_oos_size
        );
    }
    inner.rs.ov_last_oos_size = 0;
}

impl Connection {
    /// Run the action of a completed peer read.
    pub(crate) fn w_peer_req(&self, vnr: u32, handle: PeerReqHandle, cancel: bool) -> ReplResult<()> {
        let device = self.device(vnr)?;
        let req = device
            .lock()
            .peer_reqs
            .remove(handle)
            .ok_or(ReplError::StaleHandle)?;
        match req.action {
            PeerAction::EndDataReq => self.w_e_end_data_req(&device, req, cancel),
            PeerAction::EndRsDataReq => self.w_e_end_rsdata_req(&device, req, cancel),
            PeerAction::EndCsumRsReq => self.w_e_end_csum_rs_req(&device, req, cancel),
            PeerAction::EndOvReq => self.w_e_end_ov_req(&device, req, cancel),
            PeerAction::EndOvReply => self.w_e_end_ov_reply(&device, req, cancel),
            PeerAction::SendCsum => self.w_e_send_csum(&device, req, cancel),
            PeerAction::WriteAck | PeerAction::RsWriteAck => {
                warn!("minor {}: write completion queued for the sender", device.minor);
                device.dec_unacked();
                Ok(())
            }
        }
    }

    /// Answer an application read of the peer.
    fn w_e_end_data_req(&self, device: &Device, req: PeerRequest, cancel: bool) -> ReplResult<()> {
        let vnr = device.vnr;
        let result = if cancel {
            Ok(())
        } else if !req.was_error() {
            self.transport.send(Packet::DataReply {
                vnr,
                sector: req.sector,
                block_id: req.block_id,
                data: req.pages.unwrap_or_default(),
            })
        } else {
            ratelimited!(
                self.limiter,
                error,
                "minor {}: Sending NegDReply. sector={}",
                device.minor,
                req.sector
            );
            self.transport.send(Packet::NegDReply {
                vnr,
                sector: req.sector,
                size: req.size,
                block_id: req.block_id,
            })
        };
        device.dec_unacked();
        result
    }

    /// Answer a resync data request.
    fn w_e_end_rsdata_req(&self, device: &Device, req: PeerRequest, cancel: bool) -> ReplResult<()> {
        if cancel {
            device.dec_unacked();
            return Ok(());
        }
        let vnr = device.vnr;
        let (sector, size) = (req.sector, req.size);
        let state = {
            let mut inner = device.lock();
            device.rs_complete_io(&mut inner, sector);
            inner.state
        };
        let result = if state.conn == ConnState::Ahead {
            self.transport.send(Packet::RsCancel { vnr, sector, size })
        } else if !req.was_error() {
            if state.pdsk >= DiskState::Inconsistent {
                device.inc_rs_pending();
                self.transport.send(Packet::RsDataReply {
                    vnr,
                    sector,
                    block_id: ID_SYNCER,
                    data: req.pages.unwrap_or_default(),
                })
            } else {
                ratelimited!(
                    self.limiter,
                    error,
                    "minor {}: Not sending RSDataReply, partner DISKLESS!",
                    device.minor
                );
                Ok(())
            }
        } else {
            ratelimited!(
                self.limiter,
                error,
                "minor {}: Sending NegRSDReply. sector {}.",
                device.minor,
                sector
            );
            let sent = self.transport.send(Packet::NegRsDReply { vnr, sector, size });
            if device.rs_failed_io(sector, size) {
                self.work.signal_device_work();
            }
            sent
        };
        device.dec_unacked();
        result
    }

    /// Compare the peer's checksum with the local block: equal blocks are
    /// acked as in sync, different ones are sent in full.
    fn w_e_end_csum_rs_req(&self, device: &Device, req: PeerRequest, cancel: bool) -> ReplResult<()> {
        if cancel {
            device.dec_unacked();
            return Ok(());
        }
        let vnr = device.vnr;
        let (sector, size) = (req.sector, req.size);
        {
            let mut inner = device.lock();
            device.rs_complete_io(&mut inner, sector);
        }
        let result = if !req.was_error() {
            let data = req.pages.unwrap_or_default();
            let eq = match (&self.csums, &req.digest) {
                (Some(csums), Some(theirs)) => {
                    if theirs.len() != csums.size() {
                        device.dec_unacked();
                        return Err(ReplError::ProtocolViolation {
                            msg: format!(
                                "checksum of {} bytes, {} expects {}",
                                theirs.len(),
                                csums.name(),
                                csums.size()
                            ),
                        });
                    }
                    csums.compute(&[&data]) == *theirs
                }
                _ => false,
            };
            if eq {
                if device.set_in_sync(sector, size) {
                    self.work.signal_device_work();
                }
                device.lock().rs.rs_same_csum += (size >> BM_BLOCK_SHIFT) as u64;
                self.transport.send(Packet::RsIsInSync { vnr, sector, size })
            } else {
                device.inc_rs_pending();
                self.transport.send(Packet::RsDataReply {
                    vnr,
                    sector,
                    block_id: ID_SYNCER,
                    data,
                })
            }
        } else {
            ratelimited!(
                self.limiter,
                error,
                "minor {}: Sending NegDReply. I guess it gets messy.",
                device.minor
            );
            self.transport.send(Packet::NegRsDReply { vnr, sector, size })
        };
        device.dec_unacked();
        result
    }

    /// Answer a verify request with the digest of the local block (zeros
    /// if the read failed).
    fn w_e_end_ov_req(&self, device: &Device, req: PeerRequest, cancel: bool) -> ReplResult<()> {
        if cancel {
            device.dec_unacked();
            return Ok(());
        }
        let Some(verify) = self.verify.as_ref() else {
            device.dec_unacked();
            return Err(ReplError::UnknownDigest {
                name: String::from("verify-alg"),
            });
        };
        let digest = match (&req.pages, req.was_error()) {
            (Some(data), false) => verify.compute(&[data]),
            _ => vec![0u8; verify.size()],
        };
        let (sector, size) = (req.sector, req.size);
        drop(req);
        device.inc_rs_pending();
        let result = self.transport.send(Packet::OvReply {
            vnr: device.vnr,
            sector,
            size,
            digest,
        });
        if result.is_err() {
            device.dec_rs_pending();
        }
        device.dec_unacked();
        result
    }

    /// Compare our digest with the peer's verify reply and send the result.
    fn w_e_end_ov_reply(&self, device: &Device, req: PeerRequest, cancel: bool) -> ReplResult<()> {
        if cancel {
            device.dec_unacked();
            return Ok(());
        }
        let vnr = device.vnr;
        let (sector, size) = (req.sector, req.size);
        let eq = match (&self.verify, &req.pages, &req.digest, req.was_error()) {
            (Some(verify), Some(data), Some(theirs), false) => verify.compute(&[data]) == *theirs,
            _ => false,
        };
        drop(req);

        let finished = {
            let mut inner = device.lock();
            device.rs_complete_io(&mut inner, sector);
            if eq {
                ov_out_of_sync_print(device, &mut inner);
            } else {
                ov_out_of_sync_found(device, &mut inner, sector, size);
            }
            inner.rs.ov_left = inner.rs.ov_left.saturating_sub(1);
            let stop_reached = inner
                .rs
                .ov_stop_sector
                .is_some_and(|stop| sector + (size as u64 >> SECTOR_SHIFT) >= stop);
            inner.rs.ov_left == 0 || stop_reached
        };
        let result = self.transport.send(Packet::OvResult {
            vnr,
            sector,
            size,
            block_id: if eq { ID_IN_SYNC } else { ID_OUT_OF_SYNC },
        });
        device.dec_unacked();
        if finished {
            self.work.push(WorkItem::OvFinished { vnr });
        }
        result
    }

    /// Send the checksum of a block read on the sync target. A failed read
    /// falls back to requesting the full block.
    fn w_e_send_csum(&self, device: &Device, req: PeerRequest, cancel: bool) -> ReplResult<()> {
        if cancel {
            return Ok(());
        }
        let vnr = device.vnr;
        let (sector, size) = (req.sector, req.size);
        let digest = match (&self.csums, &req.pages, req.was_error()) {
            (Some(csums), Some(data), false) => Some(csums.compute(&[data])),
            _ => None,
        };
        drop(req);
        device.inc_rs_pending();
        let result = match digest {
            Some(digest) => self.transport.send(Packet::CsumRsRequest {
                vnr,
                sector,
                size,
                digest,
            }),
            None => {
                info!(
                    "minor {}: no local checksum for sector {}, requesting full block",
                    device.minor, sector
                );
                self.transport.send(Packet::RsDataRequest {
                    vnr,
                    sector,
                    size,
                    block_id: ID_SYNCER,
                })
            }
        };
        if result.is_err() {
            device.dec_rs_pending();
            error!("minor {}: sending checksum request failed", device.minor);
        }
        result
    }

    /// Verify finished on this side.
    pub(crate) async fn w_ov_finished(&self, vnr: u32, cancel: bool) -> ReplResult<()> {
        if cancel {
            return Ok(());
        }
        let device = self.device(vnr)?;
        {
            let mut inner = device.lock();
            ov_out_of_sync_print(&device, &mut inner);
        }
        self.resync_finished(&device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;
    use crate::config::{DiskConf, NetConf};
    use crate::connection::tests::{test_node, TestNode};
    use crate::digest::{Digest, Sha256Digest};

    fn with_algs() -> NetConf {
        NetConf {
            csums_alg: Some("sha256".into()),
            verify_alg: Some("sha256".into()),
            ..Default::default()
        }
    }

    fn sha(data: &[u8]) -> Vec<u8> {
        Sha256Digest.compute(&[data])
    }

    /// Receive `packet`, complete the local read and run the sender.
    async fn serve(n: &TestNode, packet: Packet) -> Vec<Packet> {
        n.conn.receive(packet).unwrap();
        n.complete_io();
        n.conn.run_pending().await.unwrap();
        n.transport.take_sent()
    }

    #[tokio::test]
    async fn test_rs_data_request_answered_with_data() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.disk.write_at(8, &[3u8; 4096]);
        let sent = serve(
            &n,
            Packet::RsDataRequest {
                vnr: 0,
                sector: 8,
                size: 4096,
                block_id: ID_SYNCER,
            },
        )
        .await;
        let Packet::RsDataReply { sector, data, .. } = &sent[0] else {
            panic!("unexpected {:?}", sent[0]);
        };
        assert_eq!(*sector, 8);
        assert_eq!(data[0], 3);
        assert_eq!(n.device.rs_pending(), 1);
        assert_eq!(n.device.unacked(), 0);
        assert!(n.device.lock().rs_extents.is_empty());
    }

    #[tokio::test]
    async fn test_rs_data_request_in_ahead_cancelled() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.conn.receive(Packet::RsDataRequest {
            vnr: 0,
            sector: 0,
            size: 4096,
            block_id: ID_SYNCER,
        })
        .unwrap();
        n.device.update_state(|s| s.conn = ConnState::Ahead);
        n.complete_io();
        n.conn.run_pending().await.unwrap();
        assert_eq!(
            n.transport.take_sent(),
            vec![Packet::RsCancel {
                vnr: 0,
                sector: 0,
                size: 4096
            }]
        );
    }

    #[tokio::test]
    async fn test_rs_data_request_read_error_nacked() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.disk.fail_sector(0);
        n.bitmap.set_bits(0, 1);
        n.device.update_state(|s| s.conn = ConnState::SyncSource);
        let sent = serve(
            &n,
            Packet::RsDataRequest {
                vnr: 0,
                sector: 0,
                size: 4096,
                block_id: ID_SYNCER,
            },
        )
        .await;
        assert!(sent.contains(&Packet::NegRsDReply {
            vnr: 0,
            sector: 0,
            size: 4096
        }));
        assert_eq!(n.device.lock().rs.rs_failed, 1);
    }

    #[tokio::test]
    async fn test_equal_checksum_acked_in_sync() {
        let n = test_node(16, DiskConf::default(), with_algs());
        n.disk.write_at(0, &[1u8; 4096]);
        n.bitmap.set_bits(0, 0);
        n.device.update_state(|s| s.conn = ConnState::SyncSource);
        let sent = serve(
            &n,
            Packet::CsumRsRequest {
                vnr: 0,
                sector: 0,
                size: 4096,
                digest: sha(&[1u8; 4096]),
            },
        )
        .await;
        assert!(sent.contains(&Packet::RsIsInSync {
            vnr: 0,
            sector: 0,
            size: 4096
        }));
        assert!(!n.bitmap.test_bit(0));
        assert_eq!(n.device.lock().rs.rs_same_csum, 1);
    }

    #[tokio::test]
    async fn test_different_checksum_sends_block() {
        let n = test_node(16, DiskConf::default(), with_algs());
        n.disk.write_at(0, &[1u8; 4096]);
        let sent = serve(
            &n,
            Packet::CsumRsRequest {
                vnr: 0,
                sector: 0,
                size: 4096,
                digest: sha(&[2u8; 4096]),
            },
        )
        .await;
        assert!(matches!(sent[0], Packet::RsDataReply { .. }));
        assert_eq!(n.device.rs_pending(), 1);
    }

    #[tokio::test]
    async fn test_checksum_size_mismatch_is_protocol_violation() {
        let n = test_node(16, DiskConf::default(), with_algs());
        let sent = serve(
            &n,
            Packet::CsumRsRequest {
                vnr: 0,
                sector: 0,
                size: 4096,
                digest: vec![0u8; 4],
            },
        )
        .await;
        assert!(sent.is_empty());
        assert_eq!(n.conn.cstate(), ConnState::NetworkFailure);
    }

    #[tokio::test]
    async fn test_verify_request_answered_with_digest() {
        let n = test_node(16, DiskConf::default(), with_algs());
        n.disk.write_at(16, &[6u8; 4096]);
        let sent = serve(
            &n,
            Packet::OvRequest {
                vnr: 0,
                sector: 16,
                size: 4096,
                stop: None,
            },
        )
        .await;
        assert_eq!(
            sent,
            vec![Packet::OvReply {
                vnr: 0,
                sector: 16,
                size: 4096,
                digest: sha(&[6u8; 4096])
            }]
        );
    }

    #[tokio::test]
    async fn test_verify_reply_mismatch_found_and_finished() {
        let n = test_node(16, DiskConf::default(), with_algs());
        n.device.update_state(|s| s.conn = ConnState::VerifyS);
        {
            let mut inner = n.device.lock();
            inner.rs.ov_left = 2;
            inner.rs.rs_total = 2;
            n.device.rs_begin_io(&mut inner, 0);
            n.device.rs_begin_io(&mut inner, 8);
        }
        n.device.inc_rs_pending();
        n.device.inc_rs_pending();
        n.disk.write_at(8, &[9u8; 4096]);
        for sector in [0u64, 8] {
            n.conn
                .receive(Packet::OvReply {
                    vnr: 0,
                    sector,
                    size: 4096,
                    digest: sha(&[0u8; 4096]),
                })
                .unwrap();
        }
        n.complete_io();
        n.conn.run_pending().await.unwrap();
        let results: Vec<u64> = n
            .transport
            .take_sent()
            .into_iter()
            .filter_map(|p| match p {
                Packet::OvResult { block_id, .. } => Some(block_id),
                _ => None,
            })
            .collect();
        assert_eq!(results, vec![ID_IN_SYNC, ID_OUT_OF_SYNC]);
        assert!(n.bitmap.test_bit(1));
        assert_eq!(n.device.stats().ov_out_of_sync, 1);
        // last result finished the verify
        assert_eq!(n.device.state().conn, ConnState::Connected);
    }

    #[tokio::test]
    async fn test_csum_read_failure_requests_full_block() {
        let n = test_node(16, DiskConf::default(), with_algs());
        n.disk.fail_sector(0);
        n.device.update_state(|s| s.disk = DiskState::Inconsistent);
        n.conn.read_for_csum(&n.device, 0, 4096).unwrap();
        n.complete_io();
        n.conn.run_pending().await.unwrap();
        assert_eq!(
            n.transport.take_sent(),
            vec![Packet::RsDataRequest {
                vnr: 0,
                sector: 0,
                size: 4096,
                block_id: ID_SYNCER
            }]
        );
        assert_eq!(n.device.rs_pending(), 1);
    }

    #[test]
    fn test_oos_runs_merge() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        let mut inner = n.device.lock();
        ov_out_of_sync_found(&n.device, &mut inner, 8, 4096);
        ov_out_of_sync_found(&n.device, &mut inner, 16, 4096);
        assert_eq!(inner.rs.ov_last_oos_start, 8);
        assert_eq!(inner.rs.ov_last_oos_size, 16);
        ov_out_of_sync_found(&n.device, &mut inner, 64, 4096);
        assert_eq!(inner.rs.ov_last_oos_start, 64);
        ov_out_of_sync_print(&n.device, &mut inner);
        assert_eq!(inner.rs.ov_last_oos_size, 0);
        assert_eq!(inner.rs.ov_oos_found, 3);
        drop(inner);
        assert_eq!(n.bitmap.total_weight(), 3);
    }
}
