//! Resync-after dependencies between devices.
//!
//! A device configured with `resync_after = N` does not resync while device
//! `N` (or anything `N` itself waits for) is syncing or paused. The graph
//! keeps every registered device by minor number; all pause/resume sweeps
//! run under the write lock so no device sees a half-updated neighborhood.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::device::{Device, MINOR_MASK};
use crate::error::{ReplError, ReplResult};
use crate::state::{ConnState, DiskState, StateChange};

type DeviceMap = BTreeMap<u32, Arc<Device>>;

/// All devices of this node that may take part in resync-after chains.
#[derive(Default)]
pub struct ResyncGraph {
    devices: RwLock<DeviceMap>,
}

impl ResyncGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device. Its configured dependency must not close a cycle.
    pub fn register(&self, device: Arc<Device>) -> ReplResult<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(&device.minor) {
            return Err(ReplError::StateRefused {
                minor: device.minor,
                reason: "minor already in use",
            });
        }
        validate(&devices, device.minor, device.disk_conf().resync_after)?;
        debug!("resync graph: registered minor {}", device.minor);
        devices.insert(device.minor, device);
        sweep_locked(&devices);
        Ok(())
    }

    /// Remove a device; devices waiting for it may resume.
    pub fn unregister(&self, minor: u32) {
        let mut devices = self.devices.write();
        if devices.remove(&minor).is_some() {
            debug!("resync graph: unregistered minor {}", minor);
            sweep_locked(&devices);
        }
    }

    /// Check that `minor` may depend on `after`.
    pub fn validate_resync_after(&self, minor: u32, after: Option<u32>) -> ReplResult<()> {
        validate(&self.devices.read(), minor, after)
    }

    /// Change the dependency of `minor`. Rejected changes leave the graph
    /// untouched.
    pub fn set_resync_after(&self, minor: u32, after: Option<u32>) -> ReplResult<()> {
        let devices = self.devices.write();
        validate(&devices, minor, after)?;
        let device = devices.get(&minor).ok_or(ReplError::ResyncAfterInvalid { after: minor })?;
        let mut conf = device.disk_conf();
        conf.resync_after = after;
        device.set_disk_conf(conf);
        info!("minor {}: resync-after set to {:?}", minor, after);
        sweep_locked(&devices);
        Ok(())
    }

    /// Whether nothing `device` depends on is syncing or paused.
    pub fn may_sync_now(&self, device: &Device) -> bool {
        may_sync_now(&self.devices.read(), device)
    }

    /// Pause and resume devices until every device agrees with its
    /// predecessors. Returns whether anything changed.
    pub fn sweep(&self) -> bool {
        sweep_locked(&self.devices.write())
    }
}

impl std::fmt::Debug for ResyncGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncGraph")
            .field("minors", &self.devices.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

fn is_diskless(device: &Device) -> bool {
    device.state().disk == DiskState::Diskless
}

/// Walk the chain from `after`; reaching `minor` again is a cycle.
/// Depending on unknown or diskless minors is allowed.
fn validate(devices: &DeviceMap, minor: u32, after: Option<u32>) -> ReplResult<()> {
    let Some(after) = after else {
        return Ok(());
    };
    if after > MINOR_MASK {
        return Err(ReplError::ResyncAfterInvalid { after });
    }
    let mut cur = after;
    for _ in 0..=devices.len() {
        if cur == minor {
            return Err(ReplError::ResyncAfterCycle { minor, after });
        }
        let Some(odev) = devices.get(&cur) else {
            return Ok(());
        };
        if is_diskless(odev) {
            return Ok(());
        }
        match odev.disk_conf().resync_after {
            Some(next) => cur = next,
            None => return Ok(()),
        }
    }
    // a chain longer than the graph loops without passing `minor`
    Err(ReplError::ResyncAfterCycle { minor, after })
}

fn may_sync_now(devices: &DeviceMap, device: &Device) -> bool {
    let mut next = device.disk_conf().resync_after;
    for _ in 0..=devices.len() {
        let Some(minor) = next else {
            return true;
        };
        let Some(odev) = devices.get(&minor) else {
            return true;
        };
        if is_diskless(odev) {
            return true;
        }
        let st = odev.state();
        if st.conn.is_syncing() || st.is_paused() {
            return false;
        }
        next = odev.disk_conf().resync_after;
    }
    true
}

/// Pause every device whose predecessor syncs.
fn pause_after(devices: &DeviceMap) -> bool {
    let mut changed = false;
    for odev in devices.values() {
        let st = odev.state();
        if st.conn == ConnState::StandAlone && st.disk == DiskState::Diskless {
            continue;
        }
        if !st.aftr_isp && !may_sync_now(devices, odev) {
            changed |= odev.update_state(|s| s.aftr_isp = true) == StateChange::Changed;
        }
    }
    changed
}

/// Resume every paused device whose predecessors are done.
fn resume_next(devices: &DeviceMap) -> bool {
    let mut changed = false;
    for odev in devices.values() {
        let st = odev.state();
        if st.conn == ConnState::StandAlone && st.disk == DiskState::Diskless {
            continue;
        }
        if st.aftr_isp && may_sync_now(devices, odev) {
            changed |= odev.update_state(|s| s.aftr_isp = false) == StateChange::Changed;
        }
    }
    changed
}

fn sweep_locked(devices: &DeviceMap) -> bool {
    let mut any = false;
    // each round settles at least one more link of the longest chain
    for _ in 0..=devices.len() {
        let changed = pause_after(devices) | resume_next(devices);
        if !changed {
            break;
        }
        any = true;
    }
    any
}
