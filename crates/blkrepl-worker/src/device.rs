//! One replicated block device.
//!
//! Mutable state lives in [`DeviceInner`] behind the device lock. Counters
//! that completion context touches are atomics on [`Device`] itself so that
//! the hot paths never wait for the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::bitmap::{
    bits_to_kib, in_sync_bit_range, out_of_sync_bit_range, sect_to_ext, Bitmap, Sector,
};
use crate::block_io::BlockIo;
use crate::config::DiskConf;
use crate::controller::RateController;
use crate::error::{ReplError, ReplResult};
use crate::hook::NotificationHook;
use crate::metadata::{MetadataRecord, MetadataStore, UuidSet};
use crate::peer_request::{PeerReqHandle, PeerRequest};
use crate::ratelimit::LogRateLimiter;
use crate::request::LocalRequest;
use crate::state::{ConnState, DeviceState, DiskState, StateChange};

/// Device work bit: resync has nothing left to do.
pub const RS_DONE: u32 = 1 << 0;
/// Device work bit: report resync progress.
pub const RS_PROGRESS: u32 = 1 << 1;
/// Device work bit: persist metadata.
pub const MD_SYNC: u32 = 1 << 2;

/// Minimum interval between two progress reports.
pub const RS_PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Highest valid device minor.
pub const MINOR_MASK: u32 = (1 << 20) - 1;

/// Resync and verify bookkeeping.
#[derive(Debug, Clone)]
pub struct ResyncProgress {
    /// Bits to sync (verify: blocks to check) when the run started.
    pub rs_total: u64,
    /// Bits that could not be synced.
    pub rs_failed: u64,
    /// Blocks found equal by checksum comparison.
    pub rs_same_csum: u64,
    /// When the run started.
    pub rs_start: Instant,
    /// Time spent paused so far.
    pub rs_paused: Duration,
    /// Set while paused.
    pub paused_since: Option<Instant>,
    /// Last progress report.
    pub last_progress: Instant,
    /// Resync cursor (bit).
    pub bm_resync_fo: u64,
    /// Checksum-based resync negotiated for this run.
    pub use_csums: bool,
    /// Verify cursor (sector).
    pub ov_position: Sector,
    /// Where the current verify run started (sector).
    pub ov_start_sector: Sector,
    /// Optional verify stop position (sector).
    pub ov_stop_sector: Option<Sector>,
    /// Verify blocks still expected.
    pub ov_left: u64,
    /// Waiting for the first verify request to learn the start position.
    pub ov_start_pending: bool,
    /// Start of the current out-of-sync run found by verify.
    pub ov_last_oos_start: Sector,
    /// Length in sectors of that run (0 = none).
    pub ov_last_oos_size: Sector,
    /// Blocks found out of sync by verify.
    pub ov_oos_found: u64,
}

impl Default for ResyncProgress {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            rs_total: 0,
            rs_failed: 0,
            rs_same_csum: 0,
            rs_start: now,
            rs_paused: Duration::ZERO,
            paused_since: None,
            last_progress: now,
            bm_resync_fo: 0,
            use_csums: false,
            ov_position: 0,
            ov_start_sector: 0,
            ov_stop_sector: None,
            ov_left: 0,
            ov_start_pending: false,
            ov_last_oos_start: 0,
            ov_last_oos_size: 0,
            ov_oos_found: 0,
        }
    }
}

/// State guarded by the device lock.
pub struct DeviceInner {
    /// Connection and disk state.
    pub state: DeviceState,
    /// Disk options.
    pub disk_conf: DiskConf,
    /// Our generation UUIDs.
    pub uuids: UuidSet,
    /// What we know of the peer's UUIDs.
    pub peer_uuids: UuidSet,
    /// Resync progress.
    pub rs: ResyncProgress,
    /// Rate controller.
    pub controller: RateController,
    /// Application requests in flight.
    pub requests: Arena<LocalRequest>,
    /// Peer requests in flight.
    pub peer_reqs: Arena<PeerRequest>,
    /// Completed peer writes waiting for the ack path.
    pub done_ee: Vec<PeerReqHandle>,
    /// Extents with application writes in flight.
    pub al_active: HashMap<u64, u32>,
    /// Extents with resync I/O in flight.
    pub rs_extents: HashMap<u64, u32>,
    /// A local I/O error was seen since attach.
    pub was_io_error: bool,
}

/// Collaborators a device is wired to.
#[derive(Clone)]
pub struct DeviceParts {
    /// Out-of-sync bitmap.
    pub bitmap: Arc<dyn Bitmap>,
    /// Local backing device.
    pub block_io: Arc<dyn BlockIo>,
    /// External event handler.
    pub hook: Arc<dyn NotificationHook>,
    /// Metadata persistence.
    pub metadata: Arc<dyn MetadataStore>,
}

/// Snapshot of resync progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncStats {
    /// Device minor.
    pub minor: u32,
    /// Connection state.
    pub conn: ConnState,
    /// Local disk state.
    pub disk: DiskState,
    /// Peer disk state.
    pub pdsk: DiskState,
    /// Total bits of the current run.
    pub rs_total: u64,
    /// Bits still to do (verify: blocks still expected).
    pub rs_left: u64,
    /// Bits that failed.
    pub rs_failed: u64,
    /// Blocks skipped by equal checksums.
    pub rs_same_csum: u64,
    /// Sectors requested and not answered.
    pub rs_in_flight: i64,
    /// Resync rate chosen on the last tick.
    pub sync_rate_kib: u64,
    /// Blocks verify found out of sync.
    pub ov_out_of_sync: u64,
    /// KiB read locally.
    pub read_kib: u64,
    /// KiB written locally.
    pub written_kib: u64,
    /// Resync replies expected from the peer.
    pub rs_pending: i64,
    /// Peer requests we still owe an answer.
    pub unacked: i64,
}

/// A replicated block device.
pub struct Device {
    /// Global device number.
    pub minor: u32,
    /// Volume number within the connection.
    pub vnr: u32,
    capacity: Sector,
    pub(crate) bitmap: Arc<dyn Bitmap>,
    pub(crate) block_io: Arc<dyn BlockIo>,
    pub(crate) hook: Arc<dyn NotificationHook>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    inner: Mutex<DeviceInner>,
    /// Sectors answered by the peer since the last controller tick.
    pub(crate) rs_sect_in: AtomicU64,
    rs_pending: AtomicI64,
    unacked: AtomicI64,
    read_kib: AtomicU64,
    written_kib: AtomicU64,
    work_bits: AtomicU32,
    resync_timer_armed: AtomicBool,
    pub(crate) resync_work_queued: AtomicBool,
    fatal: AtomicBool,
    pub(crate) io_limiter: LogRateLimiter,
}

impl Device {
    /// Create a device of `capacity` sectors.
    pub fn new(minor: u32, vnr: u32, capacity: Sector, disk_conf: DiskConf, parts: DeviceParts) -> Self {
        let steps = disk_conf.plan_steps();
        Self {
            minor,
            vnr,
            capacity,
            bitmap: parts.bitmap,
            block_io: parts.block_io,
            hook: parts.hook,
            metadata: parts.metadata,
            inner: Mutex::new(DeviceInner {
                state: DeviceState::default(),
                disk_conf,
                uuids: UuidSet::default(),
                peer_uuids: UuidSet::default(),
                rs: ResyncProgress::default(),
                controller: RateController::new(steps),
                requests: Arena::new(),
                peer_reqs: Arena::new(),
                done_ee: Vec::new(),
                al_active: HashMap::new(),
                rs_extents: HashMap::new(),
                was_io_error: false,
            }),
            rs_sect_in: AtomicU64::new(0),
            rs_pending: AtomicI64::new(0),
            unacked: AtomicI64::new(0),
            read_kib: AtomicU64::new(0),
            written_kib: AtomicU64::new(0),
            work_bits: AtomicU32::new(0),
            resync_timer_armed: AtomicBool::new(false),
            resync_work_queued: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            io_limiter: LogRateLimiter::new(),
        }
    }

    /// Device size in sectors.
    pub fn capacity(&self) -> Sector {
        self.capacity
    }

    /// The out-of-sync bitmap.
    pub fn bitmap(&self) -> &dyn Bitmap {
        self.bitmap.as_ref()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock()
    }

    /// Current state.
    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    /// Change the state through `f`. Logs and reports whether it changed.
    pub fn update_state(&self, f: impl FnOnce(&mut DeviceState)) -> StateChange {
        let mut inner = self.inner.lock();
        self.update_state_locked(&mut inner, f)
    }

    pub(crate) fn update_state_locked(
        &self,
        inner: &mut DeviceInner,
        f: impl FnOnce(&mut DeviceState),
    ) -> StateChange {
        let old = inner.state;
        let mut new = old;
        f(&mut new);
        new.normalize();
        if new == old {
            return StateChange::NothingToDo;
        }
        info!("minor {}: {} -> {}", self.minor, old, new);
        inner.state = new;
        self.after_state_change(inner, old, new);
        StateChange::Changed
    }

    fn after_state_change(&self, inner: &mut DeviceInner, old: DeviceState, new: DeviceState) {
        let now = Instant::now();
        let was_paused = matches!(old.conn, ConnState::PausedSyncS | ConnState::PausedSyncT);
        let is_paused = matches!(new.conn, ConnState::PausedSyncS | ConnState::PausedSyncT);
        if !was_paused && is_paused {
            inner.rs.paused_since = Some(now);
        }
        if was_paused && !is_paused {
            if let Some(since) = inner.rs.paused_since.take() {
                inner.rs.rs_paused += now.saturating_duration_since(since);
            }
            if new.conn == ConnState::SyncTarget {
                self.arm_resync_timer();
            }
        }
    }

    /// Current disk options.
    pub fn disk_conf(&self) -> DiskConf {
        self.inner.lock().disk_conf.clone()
    }

    /// Replace the disk options, resizing the controller plan if needed.
    pub fn set_disk_conf(&self, conf: DiskConf) {
        let mut inner = self.inner.lock();
        inner.controller.resize(conf.plan_steps());
        inner.disk_conf = conf;
    }

    /// Our UUIDs.
    pub fn uuids(&self) -> UuidSet {
        self.inner.lock().uuids
    }

    /// Set our UUIDs (attach).
    pub fn set_uuids(&self, uuids: UuidSet) {
        self.inner.lock().uuids = uuids;
    }

    /// What we know of the peer's UUIDs.
    pub fn peer_uuids(&self) -> UuidSet {
        self.inner.lock().peer_uuids
    }

    /// Record the peer's UUIDs (handshake).
    pub fn set_peer_uuids(&self, uuids: UuidSet) {
        self.inner.lock().peer_uuids = uuids;
    }

    /// Has a usable local disk.
    pub fn has_ldev(&self) -> bool {
        self.state().has_ldev()
    }

    // ---- fatal corruption hazard ----

    /// Stop accepting local I/O after a corruption hazard.
    pub fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    /// A corruption hazard was raised on this device.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    // ---- counters ----

    pub(crate) fn inc_rs_pending(&self) {
        self.rs_pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_rs_pending(&self) {
        if self.rs_pending.fetch_sub(1, Ordering::AcqRel) <= 0 {
            warn!("minor {}: rs_pending_cnt went negative", self.minor);
        }
    }

    /// Resync replies expected from the peer.
    pub fn rs_pending(&self) -> i64 {
        self.rs_pending.load(Ordering::Acquire)
    }

    pub(crate) fn inc_unacked(&self) {
        self.unacked.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_unacked(&self) {
        if self.unacked.fetch_sub(1, Ordering::AcqRel) <= 0 {
            warn!("minor {}: unacked_cnt went negative", self.minor);
        }
    }

    /// Peer requests we still owe an answer.
    pub fn unacked(&self) -> i64 {
        self.unacked.load(Ordering::Acquire)
    }

    pub(crate) fn add_rs_sect_in(&self, sectors: u64) {
        self.rs_sect_in.fetch_add(sectors, Ordering::AcqRel);
    }

    pub(crate) fn add_read_kib(&self, kib: u64) {
        self.read_kib.fetch_add(kib, Ordering::Relaxed);
    }

    pub(crate) fn add_written_kib(&self, kib: u64) {
        self.written_kib.fetch_add(kib, Ordering::Relaxed);
    }

    // ---- unqueued work ----

    /// Set device work bits. The caller wakes the sender.
    pub(crate) fn post_work(&self, bits: u32) {
        self.work_bits.fetch_or(bits, Ordering::AcqRel);
    }

    pub(crate) fn take_work(&self) -> u32 {
        self.work_bits.swap(0, Ordering::AcqRel)
    }

    // ---- resync timer ----

    /// Have the resync timer fire on the next tick.
    pub fn arm_resync_timer(&self) {
        self.resync_timer_armed.store(true, Ordering::Release);
    }

    /// Whether the resync timer is armed.
    pub fn resync_timer_armed(&self) -> bool {
        self.resync_timer_armed.load(Ordering::Acquire)
    }

    pub(crate) fn take_resync_timer(&self) -> bool {
        self.resync_timer_armed.swap(false, Ordering::AcqRel)
    }

    // ---- extent reservations ----

    /// Reserve the extent of `sector` for resync unless application writes
    /// are active in it.
    pub(crate) fn try_rs_begin_io(&self, inner: &mut DeviceInner, sector: Sector) -> bool {
        let ext = sect_to_ext(sector);
        if inner.al_active.get(&ext).copied().unwrap_or(0) > 0 {
            return false;
        }
        *inner.rs_extents.entry(ext).or_insert(0) += 1;
        true
    }

    /// Reserve the extent of `sector` for resync unconditionally (serving
    /// the peer's requests).
    pub(crate) fn rs_begin_io(&self, inner: &mut DeviceInner, sector: Sector) {
        *inner.rs_extents.entry(sect_to_ext(sector)).or_insert(0) += 1;
    }

    /// Release a resync reservation.
    pub(crate) fn rs_complete_io(&self, inner: &mut DeviceInner, sector: Sector) {
        let ext = sect_to_ext(sector);
        match inner.rs_extents.get_mut(&ext) {
            Some(refs) if *refs > 1 => *refs -= 1,
            Some(_) => {
                inner.rs_extents.remove(&ext);
            }
            None => warn!(
                "minor {}: rs_complete_io() called, but extent {} not found",
                self.minor, ext
            ),
        }
    }

    /// Drop all resync reservations. Fails while any is still in use.
    pub(crate) fn rs_del_all(&self, inner: &mut DeviceInner) -> bool {
        if inner.rs_extents.values().any(|refs| *refs > 0) {
            return false;
        }
        inner.rs_extents.clear();
        true
    }

    pub(crate) fn al_begin_io(&self, inner: &mut DeviceInner, sector: Sector) {
        *inner.al_active.entry(sect_to_ext(sector)).or_insert(0) += 1;
    }

    pub(crate) fn al_complete_io(&self, inner: &mut DeviceInner, sector: Sector) {
        let ext = sect_to_ext(sector);
        if let Some(refs) = inner.al_active.get_mut(&ext) {
            *refs -= 1;
            if *refs == 0 {
                inner.al_active.remove(&ext);
            }
        }
    }

    // ---- bitmap updates ----

    /// Mark a range in sync. Posts progress and done work as appropriate;
    /// returns true if the sender should be woken.
    pub(crate) fn set_in_sync(&self, sector: Sector, size: u32) -> bool {
        let Some((first, last)) = in_sync_bit_range(sector, size, self.capacity) else {
            return false;
        };
        let cleared = self.bitmap.clear_bits(first, last);
        if cleared == 0 {
            return false;
        }
        self.after_sync_bits_changed()
    }

    /// Record that a resync range could not be synced.
    pub(crate) fn rs_failed_io(&self, sector: Sector, size: u32) -> bool {
        let Some((first, last)) = in_sync_bit_range(sector, size, self.capacity) else {
            return false;
        };
        let count = (first..=last).filter(|b| self.bitmap.test_bit(*b)).count() as u64;
        if count == 0 {
            return false;
        }
        self.inner.lock().rs.rs_failed += count;
        self.after_sync_bits_changed()
    }

    fn after_sync_bits_changed(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.conn.is_resync() {
            return false;
        }
        let mut bits = 0;
        let now = Instant::now();
        if now.saturating_duration_since(inner.rs.last_progress) >= RS_PROGRESS_INTERVAL {
            inner.rs.last_progress = now;
            bits |= RS_PROGRESS;
        }
        if self.bitmap.total_weight() <= inner.rs.rs_failed {
            bits |= RS_DONE;
        }
        drop(inner);
        if bits != 0 {
            self.post_work(bits);
            return true;
        }
        false
    }

    /// Mark a range out of sync.
    pub(crate) fn set_out_of_sync(&self, sector: Sector, size: u32) -> u64 {
        match out_of_sync_bit_range(sector, size, self.capacity) {
            Some((first, last)) => self.bitmap.set_bits(first, last),
            None => 0,
        }
    }

    // ---- metadata ----

    /// Persist metadata now.
    pub fn md_sync(&self) -> ReplResult<()> {
        let record = {
            let inner = self.inner.lock();
            MetadataRecord {
                uuids: inner.uuids,
                consistent: inner.state.disk >= DiskState::Consistent,
                up_to_date: inner.state.disk == DiskState::UpToDate,
                peer_outdated: inner.state.pdsk <= DiskState::Outdated
                    && inner.state.pdsk >= DiskState::Inconsistent,
                ov_start_sector: inner.rs.ov_start_sector,
            }
        };
        debug!("minor {}: md_sync", self.minor);
        self.metadata.persist(self.minor, &record)
    }

    // ---- stats ----

    /// Progress snapshot.
    pub fn stats(&self) -> ResyncStats {
        let inner = self.inner.lock();
        let rs_left = if inner.state.conn.is_verify() {
            inner.rs.ov_left
        } else {
            self.bitmap.total_weight()
        };
        ResyncStats {
            minor: self.minor,
            conn: inner.state.conn,
            disk: inner.state.disk,
            pdsk: inner.state.pdsk,
            rs_total: inner.rs.rs_total,
            rs_left,
            rs_failed: inner.rs.rs_failed,
            rs_same_csum: inner.rs.rs_same_csum,
            rs_in_flight: inner.controller.in_flight(),
            sync_rate_kib: inner.controller.sync_rate_kib(),
            ov_out_of_sync: inner.rs.ov_oos_found,
            read_kib: self.read_kib.load(Ordering::Relaxed),
            written_kib: self.written_kib.load(Ordering::Relaxed),
            rs_pending: self.rs_pending(),
            unacked: self.unacked(),
        }
    }

    /// Log a one-line progress report.
    pub fn report_progress(&self) {
        let stats = self.stats();
        let done = stats.rs_total.saturating_sub(stats.rs_left);
        let percent = if stats.rs_total > 0 {
            done * 100 / stats.rs_total
        } else {
            100
        };
        info!(
            "minor {}: {} {}% ({} of {} KiB), {} KiB/s",
            self.minor,
            stats.conn,
            percent,
            bits_to_kib(done),
            bits_to_kib(stats.rs_total),
            stats.sync_rate_kib
        );
    }

    /// Refuse I/O on a device that raised a corruption hazard.
    pub(crate) fn check_not_fatal(&self) -> ReplResult<()> {
        if self.is_fatal() {
            return Err(ReplError::CorruptionHazard {
                minor: self.minor,
                sector: 0,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("minor", &self.minor)
            .field("vnr", &self.vnr)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bitmap::InMemoryBitmap;
    use crate::block_io::MemoryBlockDevice;
    use crate::hook::RecordingHook;
    use crate::metadata::MemoryMetadataStore;

    pub(crate) fn test_device(bits: u64) -> Device {
        test_device_minor(0, bits, DiskConf::default())
    }

    pub(crate) fn test_device_minor(minor: u32, bits: u64, conf: DiskConf) -> Device {
        let capacity = bits * 8;
        let parts = DeviceParts {
            bitmap: Arc::new(InMemoryBitmap::new(bits)),
            block_io: Arc::new(MemoryBlockDevice::new(capacity)),
            hook: Arc::new(RecordingHook::new()),
            metadata: Arc::new(MemoryMetadataStore::new()),
        };
        Device::new(minor, minor, capacity, conf, parts)
    }

    #[test]
    fn test_state_change_logs_and_normalizes() {
        let dev = test_device(16);
        let changed = dev.update_state(|s| {
            s.conn = ConnState::SyncTarget;
            s.aftr_isp = true;
        });
        assert_eq!(changed, StateChange::Changed);
        assert_eq!(dev.state().conn, ConnState::PausedSyncT);
        assert_eq!(
            dev.update_state(|s| s.aftr_isp = true),
            StateChange::NothingToDo
        );
    }

    #[test]
    fn test_resume_arms_timer() {
        let dev = test_device(16);
        dev.update_state(|s| {
            s.conn = ConnState::SyncTarget;
            s.aftr_isp = true;
        });
        assert!(!dev.resync_timer_armed());
        dev.update_state(|s| s.aftr_isp = false);
        assert_eq!(dev.state().conn, ConnState::SyncTarget);
        assert!(dev.take_resync_timer());
        assert!(!dev.resync_timer_armed());
    }

    #[test]
    fn test_rs_reservation_blocked_by_app_write() {
        let dev = test_device(8192);
        let mut inner = dev.lock();
        dev.al_begin_io(&mut inner, 0);
        assert!(!dev.try_rs_begin_io(&mut inner, 8));
        // next extent is free
        assert!(dev.try_rs_begin_io(&mut inner, 1 << 15));
        dev.al_complete_io(&mut inner, 0);
        assert!(dev.try_rs_begin_io(&mut inner, 8));
        assert!(!dev.rs_del_all(&mut inner));
        dev.rs_complete_io(&mut inner, 8);
        dev.rs_complete_io(&mut inner, 1 << 15);
        assert!(dev.rs_del_all(&mut inner));
    }

    #[test]
    fn test_set_in_sync_posts_done() {
        let dev = test_device(4);
        dev.bitmap.set_bits(0, 1);
        dev.update_state(|s| s.conn = ConnState::SyncTarget);
        assert!(!dev.set_in_sync(0, 4096));
        assert_eq!(dev.take_work(), 0);
        assert!(dev.set_in_sync(8, 4096));
        assert_ne!(dev.take_work() & RS_DONE, 0);
        assert_eq!(dev.bitmap.total_weight(), 0);
    }

    #[test]
    fn test_failed_io_counts_and_finishes() {
        let dev = test_device(4);
        dev.bitmap.set_bits(2, 2);
        dev.update_state(|s| s.conn = ConnState::SyncTarget);
        assert!(dev.rs_failed_io(16, 4096));
        assert_eq!(dev.lock().rs.rs_failed, 1);
        assert_ne!(dev.take_work() & RS_DONE, 0);
    }

    #[test]
    fn test_counters() {
        let dev = test_device(4);
        dev.inc_rs_pending();
        dev.inc_unacked();
        dev.dec_rs_pending();
        assert_eq!(dev.rs_pending(), 0);
        assert_eq!(dev.unacked(), 1);
        let stats = dev.stats();
        assert_eq!(stats.unacked, 1);
        assert_eq!(stats.rs_left, 0);
    }

    #[test]
    fn test_fatal_refuses() {
        let dev = test_device(4);
        assert!(dev.check_not_fatal().is_ok());
        dev.mark_fatal();
        assert!(dev.check_not_fatal().unwrap_err().is_fatal());
    }
}
