//! Starting and finishing resync and online verify runs.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::bitmap::{bits_to_kib, sect_to_bit, Sector, BM_BLOCK_SIZE, BM_SECT_PER_BIT};
use crate::connection::Connection;
use crate::controller::SLEEP_TIME;
use crate::device::{Device, ResyncProgress};
use crate::error::{ReplError, ReplResult};
use crate::hook::HelperEvent;
use crate::state::{ConnState, DiskState};
use crate::work::WorkItem;

/// Which end of a resync this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncSide {
    /// We have the good data and send it.
    Source,
    /// We receive the good data.
    Target,
}

impl ResyncSide {
    fn conn_state(self) -> ConnState {
        match self {
            ResyncSide::Source => ConnState::SyncSource,
            ResyncSide::Target => ConnState::SyncTarget,
        }
    }

    fn before_hook(self) -> HelperEvent {
        match self {
            ResyncSide::Source => HelperEvent::BeforeResyncSource,
            ResyncSide::Target => HelperEvent::BeforeResyncTarget,
        }
    }
}

/// Fresh progress for a new run, keeping the verify range settings.
fn fresh_progress(old: &ResyncProgress) -> ResyncProgress {
    ResyncProgress {
        ov_start_sector: old.ov_start_sector,
        ov_stop_sector: old.ov_stop_sector,
        ..ResyncProgress::default()
    }
}

/// Blocks a run went through. A verify stopped early covered only part of
/// its range.
fn bits_covered(rs: &ResyncProgress, verify: bool) -> u64 {
    if verify {
        rs.rs_total.saturating_sub(rs.ov_left)
    } else {
        rs.rs_total
    }
}

impl Connection {
    /// Start a resync of volume `vnr` from the out-of-sync bitmap.
    ///
    /// The before-resync handler may veto the start. A device whose
    /// resync-after predecessor is busy starts paused.
    pub fn start_resync(&self, vnr: u32, side: ResyncSide) -> ReplResult<()> {
        let device = self.device(vnr)?;
        let st = device.state();
        if st.conn.is_syncing() {
            error!("minor {}: Resync already running!", device.minor);
            return Ok(());
        }
        if self.cstate() < ConnState::Connected || st.conn < ConnState::Connected {
            return Err(ReplError::Disconnected);
        }
        if !st.has_ldev() {
            return Err(ReplError::DiskFailure { minor: device.minor });
        }

        let hook = side.before_hook();
        let code = device.hook.call(device.minor, hook);
        if code != 0 {
            // status 3 comes from handlers that predate this event
            if side == ResyncSide::Source && code == 3 {
                info!(
                    "minor {}: {} handler returned 3, ignoring",
                    device.minor,
                    hook.as_str()
                );
            } else {
                error!(
                    "minor {}: {} handler returned {}, dropping connection.",
                    device.minor,
                    hook.as_str(),
                    code
                );
                let err = ReplError::HelperRefused {
                    event: hook.as_str(),
                    code,
                };
                self.request_network_failure(&err);
                return Err(err);
            }
        }

        let may_sync = self.graph.may_sync_now(&device);
        let rs_total = device.bitmap().total_weight();
        {
            let mut inner = device.lock();
            inner.rs = fresh_progress(&inner.rs);
            inner.rs.rs_total = rs_total;
            inner.rs.use_csums = side == ResyncSide::Target && self.csums.is_some();
            let steps = inner.disk_conf.plan_steps();
            inner.controller.resize(steps);
            inner.controller.reset();
            device.update_state_locked(&mut inner, |s| {
                s.conn = side.conn_state();
                s.aftr_isp = !may_sync;
                match side {
                    ResyncSide::Source => s.pdsk = DiskState::Inconsistent,
                    ResyncSide::Target => s.disk = DiskState::Inconsistent,
                }
            });
        }
        device.rs_sect_in.store(0, Ordering::Release);
        info!(
            "minor {}: Began resync as {} (will sync {} KB [{} bits set]).",
            device.minor,
            side.conn_state(),
            bits_to_kib(rs_total),
            rs_total
        );
        self.graph.sweep();
        device.md_sync()?;

        let conn = device.state().conn;
        if rs_total == 0 && side == ResyncSide::Source {
            // nothing to send; the target finds the same on its side
            self.work.push(WorkItem::ResyncFinished { vnr });
        } else if conn == ConnState::SyncTarget {
            self.queue_resync_work(&device);
        }
        Ok(())
    }

    /// Start an online verify of volume `vnr` as the verify source,
    /// from `start` up to `stop` (whole device if None).
    pub fn start_online_verify(&self, vnr: u32, start: Sector, stop: Option<Sector>) -> ReplResult<()> {
        if self.verify.is_none() {
            return Err(ReplError::UnknownDigest {
                name: String::from("none"),
            });
        }
        let device = self.device(vnr)?;
        let start = start & !(BM_SECT_PER_BIT - 1);
        {
            let mut inner = device.lock();
            let st = inner.state;
            if st.conn != ConnState::Connected {
                return Err(ReplError::StateRefused {
                    minor: device.minor,
                    reason: "online verify needs an idle connection",
                });
            }
            if st.disk != DiskState::UpToDate || st.pdsk != DiskState::UpToDate {
                return Err(ReplError::StateRefused {
                    minor: device.minor,
                    reason: "online verify needs both disks up to date",
                });
            }
            if start >= device.capacity() {
                return Err(ReplError::StateRefused {
                    minor: device.minor,
                    reason: "verify start beyond end of device",
                });
            }
            let left = device.bitmap().bits().saturating_sub(sect_to_bit(start));
            let mut rs = fresh_progress(&inner.rs);
            rs.ov_start_sector = start;
            rs.ov_position = start;
            rs.ov_stop_sector = stop;
            rs.ov_left = left;
            rs.rs_total = left;
            inner.rs = rs;
            inner.controller.reset();
            device.update_state_locked(&mut inner, |s| s.conn = ConnState::VerifyS);
        }
        device.rs_sect_in.store(0, Ordering::Release);
        info!("minor {}: Starting Online Verify from sector {}", device.minor, start);
        self.graph.sweep();
        self.queue_resync_work(&device);
        Ok(())
    }

    /// The peer started an online verify; answer its requests as the
    /// verify target. The range is learned from the first request.
    pub fn accept_online_verify(&self, vnr: u32) -> ReplResult<()> {
        if self.verify.is_none() {
            return Err(ReplError::UnknownDigest {
                name: String::from("none"),
            });
        }
        let device = self.device(vnr)?;
        {
            let mut inner = device.lock();
            if inner.state.conn != ConnState::Connected {
                return Err(ReplError::StateRefused {
                    minor: device.minor,
                    reason: "online verify needs an idle connection",
                });
            }
            inner.rs = fresh_progress(&inner.rs);
            inner.rs.ov_stop_sector = None;
            inner.rs.ov_start_pending = true;
            device.update_state_locked(&mut inner, |s| s.conn = ConnState::VerifyT);
        }
        self.graph.sweep();
        Ok(())
    }

    /// Finish the resync or verify run of `device`.
    ///
    /// Runs again later if resync reservations are still held. Calling it
    /// when no run is active (already finished, or the link dropped) does
    /// nothing.
    pub(crate) async fn resync_finished(&self, device: &Arc<Device>) -> ReplResult<()> {
        if !device.state().conn.is_syncing() {
            return Ok(());
        }

        // in-flight replies may still hold reservations
        let drained = {
            let mut inner = device.lock();
            device.rs_del_all(&mut inner)
        };
        if !drained {
            info!("minor {}: resync extents still in use, retrying finish", device.minor);
            tokio::time::sleep(SLEEP_TIME).await;
            self.work.push(WorkItem::ResyncFinished { vnr: device.vnr });
            return Ok(());
        }

        let (dt, paused, db) = {
            let inner = device.lock();
            let mut paused = inner.rs.rs_paused;
            if let Some(since) = inner.rs.paused_since {
                paused += since.elapsed();
            }
            let dt = inner
                .rs
                .rs_start
                .elapsed()
                .saturating_sub(paused)
                .as_secs()
                .max(1);
            let db = bits_covered(&inner.rs, inner.state.conn.is_verify());
            (dt, paused.as_secs(), db)
        };
        let dbdt = bits_to_kib(db) / dt;

        // flush acks the peer still has in flight
        let timeout = Duration::from_millis(self.net_conf.ping_timeout_ms);
        match tokio::time::timeout(timeout, self.transport.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("minor {}: ping before finish failed: {}", device.minor, e),
            Err(_) => warn!("minor {}: ping before finish timed out", device.minor),
        }

        let n_oos = device.bitmap().total_weight();
        let mut helper = None;
        {
            let mut inner = device.lock();
            let os = inner.state;
            // someone else finished it, or the link dropped while we pinged
            if !os.conn.is_syncing() || self.cstate() < ConnState::Connected {
                return Ok(());
            }
            let verify = os.conn.is_verify();
            let target = os.conn.is_sync_target();
            info!(
                "minor {}: {} done (total {} sec; paused {} sec; {} K/sec)",
                device.minor,
                if verify { "Online verify" } else { "Resync" },
                dt,
                paused,
                dbdt
            );

            if verify {
                if n_oos > 0 {
                    error!(
                        "minor {}: Online verify found {} {}k block out of sync!",
                        device.minor,
                        n_oos,
                        BM_BLOCK_SIZE / 1024
                    );
                    helper = Some(HelperEvent::OutOfSync);
                }
            } else {
                if n_oos != inner.rs.rs_failed {
                    warn!(
                        "minor {}: {} blocks still out of sync, {} failed",
                        device.minor, n_oos, inner.rs.rs_failed
                    );
                }
                if target {
                    helper = Some(HelperEvent::AfterResyncTarget);
                }
                if inner.rs.use_csums && inner.rs.rs_total > 0 {
                    let same = inner.rs.rs_same_csum;
                    let total = inner.rs.rs_total;
                    info!(
                        "minor {}: {} % had equal checksums, eliminated: {}K; transferred {}K total {}K",
                        device.minor,
                        same * 100 / total,
                        bits_to_kib(same),
                        bits_to_kib(total - same),
                        bits_to_kib(total)
                    );
                }
            }

            let (disk, pdsk) = if inner.rs.rs_failed > 0 {
                info!("minor {}:             {} failed blocks", device.minor, inner.rs.rs_failed);
                if target {
                    (DiskState::Inconsistent, DiskState::UpToDate)
                } else {
                    (DiskState::UpToDate, DiskState::Inconsistent)
                }
            } else {
                if target {
                    let peer = inner.peer_uuids;
                    inner.uuids.adopt_from_sync_source(&peer);
                }
                if !verify {
                    inner.uuids.rotate_bitmap_into_history();
                    info!("minor {}: updated UUIDs {:016X}", device.minor, inner.uuids.current);
                    inner.peer_uuids = inner.uuids;
                }
                (DiskState::UpToDate, DiskState::UpToDate)
            };

            if verify {
                inner.rs.ov_start_sector = if inner.rs.ov_left == 0 {
                    0
                } else {
                    inner.rs.ov_position
                };
            }
            inner.rs.rs_total = 0;
            inner.rs.rs_failed = 0;
            inner.rs.rs_paused = Duration::ZERO;
            inner.rs.paused_since = None;
            inner.rs.last_progress = Instant::now();
            device.update_state_locked(&mut inner, |s| {
                s.conn = ConnState::Connected;
                s.disk = disk;
                s.pdsk = pdsk;
                s.aftr_isp = false;
            });
        }

        self.graph.sweep();
        device.md_sync()?;
        if let Some(event) = helper {
            device.hook.call(device.minor, event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;
    use crate::config::{DiskConf, NetConf};
    use crate::connection::tests::{test_node, TestNode};
    use crate::metadata::UuidSet;

    fn verify_net() -> NetConf {
        NetConf {
            verify_alg: Some("sha256".into()),
            ..Default::default()
        }
    }

    fn as_target(n: &TestNode) {
        n.device.update_state(|s| s.disk = DiskState::Outdated);
        n.conn.start_resync(0, ResyncSide::Target).unwrap();
    }

    #[tokio::test]
    async fn test_start_resync_as_target() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.bitmap.set_bits(2, 5);
        as_target(&n);
        let st = n.device.state();
        assert_eq!(st.conn, ConnState::SyncTarget);
        assert_eq!(st.disk, DiskState::Inconsistent);
        assert_eq!(n.device.lock().rs.rs_total, 4);
        assert_eq!(n.hook.count(HelperEvent::BeforeResyncTarget), 1);
        assert_eq!(n.conn.work.len(), 1);
        assert!(n.metadata.sync_count() > 0);
    }

    #[tokio::test]
    async fn test_start_resync_twice_is_ignored() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.bitmap.set_bits(0, 0);
        as_target(&n);
        n.conn.start_resync(0, ResyncSide::Target).unwrap();
        assert_eq!(n.hook.count(HelperEvent::BeforeResyncTarget), 1);
    }

    #[tokio::test]
    async fn test_handler_veto_drops_connection() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.hook.set_result(HelperEvent::BeforeResyncTarget, 1);
        let err = n.conn.start_resync(0, ResyncSide::Target).unwrap_err();
        assert!(matches!(err, ReplError::HelperRefused { code: 1, .. }));
        assert_eq!(n.conn.cstate(), ConnState::NetworkFailure);
        assert_eq!(n.device.state().conn, ConnState::NetworkFailure);
    }

    #[tokio::test]
    async fn test_source_ignores_legacy_handler_status() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.hook.set_result(HelperEvent::BeforeResyncSource, 3);
        n.bitmap.set_bits(0, 0);
        n.conn.start_resync(0, ResyncSide::Source).unwrap();
        assert_eq!(n.device.state().conn, ConnState::SyncSource);
        assert_eq!(n.device.state().pdsk, DiskState::Inconsistent);
    }

    #[tokio::test]
    async fn test_empty_source_resync_finishes() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.conn.start_resync(0, ResyncSide::Source).unwrap();
        n.conn.run_pending().await.unwrap();
        let st = n.device.state();
        assert_eq!(st.conn, ConnState::Connected);
        assert_eq!(st.pdsk, DiskState::UpToDate);
        assert_eq!(n.transport.pings(), 1);
    }

    #[tokio::test]
    async fn test_finish_as_target_adopts_peer_uuids() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        let peer = UuidSet {
            current: 0xAA00,
            bitmap: 0,
            history: [0xBB00, 0],
        };
        n.device.set_uuids(UuidSet {
            current: 0x1100,
            bitmap: 0,
            history: [0, 0],
        });
        n.device.set_peer_uuids(peer);
        n.bitmap.set_bits(0, 0);
        as_target(&n);
        n.bitmap.clear_bits(0, 0);
        n.conn.resync_finished(&n.device).await.unwrap();

        let st = n.device.state();
        assert_eq!(st.conn, ConnState::Connected);
        assert_eq!(st.disk, DiskState::UpToDate);
        let uuids = n.device.uuids();
        assert_eq!(uuids.current, 0xAA00);
        assert_eq!(uuids.bitmap, 0);
        assert_eq!(uuids.history[0], 0x1100);
        assert_eq!(n.device.peer_uuids(), uuids);
        assert_eq!(n.hook.count(HelperEvent::AfterResyncTarget), 1);
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.bitmap.set_bits(0, 0);
        as_target(&n);
        n.bitmap.clear_bits(0, 0);
        n.conn.resync_finished(&n.device).await.unwrap();
        let state = n.device.state();
        let syncs = n.metadata.sync_count();
        n.conn.resync_finished(&n.device).await.unwrap();
        assert_eq!(n.device.state(), state);
        assert_eq!(n.hook.count(HelperEvent::AfterResyncTarget), 1);
        assert_eq!(n.metadata.sync_count(), syncs);
        assert_eq!(n.transport.pings(), 1);
    }

    #[tokio::test]
    async fn test_failed_blocks_leave_target_inconsistent() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.bitmap.set_bits(0, 1);
        as_target(&n);
        assert!(n.device.rs_failed_io(0, 8192));
        n.conn.resync_finished(&n.device).await.unwrap();
        let st = n.device.state();
        assert_eq!(st.conn, ConnState::Connected);
        assert_eq!(st.disk, DiskState::Inconsistent);
        assert_eq!(st.pdsk, DiskState::UpToDate);
    }

    #[tokio::test]
    async fn test_finish_aborts_when_link_dropped() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.bitmap.set_bits(0, 0);
        as_target(&n);
        n.transport.set_connected(false);
        n.conn.set_cstate(ConnState::NetworkFailure);
        n.conn.resync_finished(&n.device).await.unwrap();
        assert_eq!(n.device.state().conn, ConnState::SyncTarget);
        assert_eq!(n.hook.count(HelperEvent::AfterResyncTarget), 0);
    }

    #[tokio::test]
    async fn test_finish_retries_while_extents_held() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.bitmap.set_bits(0, 0);
        as_target(&n);
        let _ = n.conn.work.with_locked(|q| q.drain(..).count());
        {
            let mut inner = n.device.lock();
            n.device.rs_begin_io(&mut inner, 0);
        }
        n.conn.resync_finished(&n.device).await.unwrap();
        assert_eq!(n.device.state().conn, ConnState::SyncTarget);
        assert_eq!(n.conn.work.len(), 1);
    }

    #[tokio::test]
    async fn test_verify_needs_algorithm_and_idle_link() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        assert!(matches!(
            n.conn.start_online_verify(0, 0, None),
            Err(ReplError::UnknownDigest { .. })
        ));
        let n = test_node(16, DiskConf::default(), verify_net());
        n.device.update_state(|s| s.conn = ConnState::SyncSource);
        assert!(matches!(
            n.conn.start_online_verify(0, 0, None),
            Err(ReplError::StateRefused { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_start_aligned() {
        let n = test_node(16, DiskConf::default(), verify_net());
        n.conn.start_online_verify(0, 21, Some(64)).unwrap();
        let inner = n.device.lock();
        assert_eq!(inner.state.conn, ConnState::VerifyS);
        assert_eq!(inner.rs.ov_position, 16);
        assert_eq!(inner.rs.ov_left, 14);
        assert_eq!(inner.rs.ov_stop_sector, Some(64));
    }

    #[tokio::test]
    async fn test_verify_finish_reports_out_of_sync() {
        let n = test_node(16, DiskConf::default(), verify_net());
        n.conn.start_online_verify(0, 0, None).unwrap();
        n.bitmap.set_bits(3, 3);
        n.device.lock().rs.ov_left = 0;
        n.conn.w_ov_finished(0, false).await.unwrap();
        let st = n.device.state();
        assert_eq!(st.conn, ConnState::Connected);
        assert_eq!(st.disk, DiskState::UpToDate);
        assert_eq!(n.hook.count(HelperEvent::OutOfSync), 1);
        assert_eq!(n.device.lock().rs.ov_start_sector, 0);
    }

    #[tokio::test]
    async fn test_accept_verify_waits_for_first_request() {
        let n = test_node(16, DiskConf::default(), verify_net());
        n.conn.accept_online_verify(0).unwrap();
        assert_eq!(n.device.state().conn, ConnState::VerifyT);
        assert!(n.device.lock().rs.ov_start_pending);
    }

    #[test]
    fn test_stopped_verify_rate_counts_covered_blocks() {
        let rs = ResyncProgress {
            rs_total: 256,
            ov_left: 248,
            ..ResyncProgress::default()
        };
        assert_eq!(bits_covered(&rs, true), 8);
        assert_eq!(bits_covered(&rs, false), 256);
    }
}
