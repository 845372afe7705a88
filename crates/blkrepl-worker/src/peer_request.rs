//! Peer requests: local reads and writes performed on behalf of the peer.

use bytes::Bytes;

use crate::arena::Handle;
use crate::bitmap::Sector;
use crate::block_io::IoDir;
use crate::transport::ID_SYNCER;

/// Handle of a [`PeerRequest`] in its device's arena.
pub type PeerReqHandle = Handle<PeerRequest>;

/// The local I/O failed.
pub const EE_WAS_ERROR: u32 = 1 << 0;
/// Release the activity-log reference when the write completes.
pub const EE_CALL_AL_COMPLETE_IO: u32 = 1 << 1;
/// The peer waits for an ack of this write.
pub const EE_SEND_WRITE_ACK: u32 = 1 << 2;

/// What happens once the local I/O of a peer request has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    /// Mirrored write: ack or nack it.
    WriteAck,
    /// Resync write: mark in sync and ack, or record the failure.
    RsWriteAck,
    /// Answer an application read of the peer.
    EndDataReq,
    /// Answer a resync data request.
    EndRsDataReq,
    /// Compare against the peer's checksum, answer with in-sync or data.
    EndCsumRsReq,
    /// Answer a verify request with our digest.
    EndOvReq,
    /// Compare our digest with the peer's verify reply.
    EndOvReply,
    /// Send our checksum to the sync source.
    SendCsum,
}

impl PeerAction {
    /// Actions that run in the sender after a read.
    pub fn is_read(&self) -> bool {
        !matches!(self, PeerAction::WriteAck | PeerAction::RsWriteAck)
    }
}

/// One I/O performed for the peer.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    /// Start sector.
    pub sector: Sector,
    /// Length in bytes.
    pub size: u32,
    /// Peer's request token, or [`ID_SYNCER`] for resync traffic.
    pub block_id: u64,
    /// Direction of the local I/O.
    pub dir: IoDir,
    /// Block I/Os submitted and not completed.
    pub pending_bios: u32,
    /// `EE_*` flags.
    pub flags: u32,
    /// Write payload or read result.
    pub pages: Option<Bytes>,
    /// Digest received from the peer.
    pub digest: Option<Vec<u8>>,
    /// Follow-up once the I/O completes.
    pub action: PeerAction,
}

impl PeerRequest {
    /// Read of `size` bytes at `sector`.
    pub fn read(sector: Sector, size: u32, block_id: u64, action: PeerAction) -> Self {
        Self {
            sector,
            size,
            block_id,
            dir: IoDir::Read,
            pending_bios: 0,
            flags: 0,
            pages: None,
            digest: None,
            action,
        }
    }

    /// Write of `data` at `sector`.
    pub fn write(sector: Sector, data: Bytes, block_id: u64, action: PeerAction) -> Self {
        Self {
            sector,
            size: data.len() as u32,
            block_id,
            dir: IoDir::Write,
            pending_bios: 0,
            flags: 0,
            pages: Some(data),
            digest: None,
            action,
        }
    }

    /// Attach the peer's digest.
    pub fn with_digest(mut self, digest: Vec<u8>) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Resync I/O rather than an application request.
    pub fn is_syncer(&self) -> bool {
        self.block_id == ID_SYNCER
    }

    /// The local I/O failed.
    pub fn was_error(&self) -> bool {
        self.flags & EE_WAS_ERROR != 0
    }
}
