//! Connection and disk state axes of a replicated device.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Replication (connection) state. Ordering matters: everything at or above
/// [`ConnState::Connected`] has a reachable peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum ConnState {
    /// Not configured for networking.
    #[default]
    StandAlone,
    /// Tearing the connection down on request.
    Disconnecting,
    /// Configured but no connection attempt in progress.
    Unconnected,
    /// Peer stopped answering.
    Timeout,
    /// Socket broke.
    BrokenPipe,
    /// Sender or receiver hit an unrecoverable send/receive error.
    NetworkFailure,
    /// Peer violated the protocol.
    ProtocolError,
    /// Connection is being torn down.
    TearDown,
    /// Waiting for the peer to connect.
    WfConnection,
    /// Socket up, exchanging parameters.
    WfReportParams,
    /// Connected, no resync running.
    Connected,
    /// About to become sync source.
    StartingSyncS,
    /// About to become sync target.
    StartingSyncT,
    /// Sync source waiting for the bitmap exchange.
    WfBitmapS,
    /// Sync target waiting for the bitmap exchange.
    WfBitmapT,
    /// Sync target waiting for the new sync UUID.
    WfSyncUuid,
    /// Sending resync data to the peer.
    SyncSource,
    /// Receiving resync data from the peer.
    SyncTarget,
    /// Running online verify as initiator.
    VerifyS,
    /// Running online verify as responder.
    VerifyT,
    /// Sync source, paused.
    PausedSyncS,
    /// Sync target, paused.
    PausedSyncT,
    /// Congested: writes are not mirrored, only marked out of sync.
    Ahead,
    /// Peer is ahead of us.
    Behind,
}

impl ConnState {
    /// Resync (not verify) in progress, paused or not.
    pub fn is_resync(self) -> bool {
        matches!(
            self,
            ConnState::SyncSource
                | ConnState::SyncTarget
                | ConnState::PausedSyncS
                | ConnState::PausedSyncT
        )
    }

    /// Online verify in progress.
    pub fn is_verify(self) -> bool {
        matches!(self, ConnState::VerifyS | ConnState::VerifyT)
    }

    /// Any resync or verify in progress, paused or not.
    pub fn is_syncing(self) -> bool {
        self >= ConnState::SyncSource && self <= ConnState::PausedSyncT
    }

    /// This side receives data during resync.
    pub fn is_sync_target(self) -> bool {
        matches!(self, ConnState::SyncTarget | ConnState::PausedSyncT)
    }

    /// The sender should treat queued work as cancelled below this state.
    pub fn is_healthy(self) -> bool {
        self >= ConnState::WfReportParams
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Local or peer disk state. Ordering matters: higher is healthier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum DiskState {
    /// No backing disk.
    #[default]
    Diskless,
    /// Attach in progress.
    Attaching,
    /// Backing disk failed.
    Failed,
    /// Negotiating with the peer.
    Negotiating,
    /// Data is not consistent (resync target).
    Inconsistent,
    /// Consistent but known to be stale.
    Outdated,
    /// Peer disk state not known.
    DUnknown,
    /// Consistent, freshness unknown.
    Consistent,
    /// Consistent and current.
    UpToDate,
}

impl fmt::Display for DiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Combined state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceState {
    /// Replication state.
    pub conn: ConnState,
    /// Local disk state.
    pub disk: DiskState,
    /// Peer disk state.
    pub pdsk: DiskState,
    /// Paused because a resync-after predecessor is syncing.
    pub aftr_isp: bool,
    /// Paused at the peer's request.
    pub peer_isp: bool,
    /// Paused by the administrator.
    pub user_isp: bool,
}

/// Outcome of a state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The state was modified.
    Changed,
    /// The requested state equals the current one.
    NothingToDo,
}

impl DeviceState {
    /// Any pause reason set.
    pub fn is_paused(&self) -> bool {
        self.aftr_isp || self.peer_isp || self.user_isp
    }

    /// The local backing disk is usable for resync I/O.
    pub fn has_ldev(&self) -> bool {
        self.disk >= DiskState::Inconsistent
    }

    /// Fold the pause flags into the replication state:
    /// a running resync with a pause reason becomes paused and vice versa.
    pub fn normalize(&mut self) {
        let paused = self.is_paused();
        self.conn = match (self.conn, paused) {
            (ConnState::SyncSource, true) => ConnState::PausedSyncS,
            (ConnState::SyncTarget, true) => ConnState::PausedSyncT,
            (ConnState::PausedSyncS, false) => ConnState::SyncSource,
            (ConnState::PausedSyncT, false) => ConnState::SyncTarget,
            (other, _) => other,
        };
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.conn, self.disk, self.pdsk)?;
        if self.is_paused() {
            write!(
                f,
                " isp({}{}{})",
                if self.aftr_isp { 'a' } else { '-' },
                if self.peer_isp { 'p' } else { '-' },
                if self.user_isp { 'u' } else { '-' }
            )?;
        }
        Ok(())
    }
}
