//! Local requests: application I/O that is served locally and mirrored to
//! (or read from) the peer.
//!
//! A request carries a state bitmask with a local half and a network half.
//! Events from the block layer, the sender and the ack path move the bits;
//! the owner of the request (see [`crate::completion`]) looks at the
//! resulting bits to decide when the application I/O is complete and when
//! the request can be dropped.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::arena::Handle;
use crate::bitmap::Sector;
use crate::error::ReplResult;

/// Handle of a [`LocalRequest`] in its device's arena.
pub type ReqHandle = Handle<LocalRequest>;

/// Receives the outcome of an application I/O: read data or empty for writes.
pub type IoReceiver = oneshot::Receiver<ReplResult<Bytes>>;

/// Local I/O submitted and not completed.
pub const RQ_LOCAL_PENDING: u32 = 1 << 0;
/// Local I/O completed (with or without error).
pub const RQ_LOCAL_COMPLETED: u32 = 1 << 1;
/// Local I/O completed successfully.
pub const RQ_LOCAL_OK: u32 = 1 << 2;
/// Local I/O was given up on; a late completion is still expected.
pub const RQ_LOCAL_ABORTED: u32 = 1 << 3;
/// Waiting for the peer (ack or data reply).
pub const RQ_NET_PENDING: u32 = 1 << 4;
/// Queued for the sender.
pub const RQ_NET_QUEUED: u32 = 1 << 5;
/// Handed to the transport.
pub const RQ_NET_SENT: u32 = 1 << 6;
/// Nothing more expected from the network.
pub const RQ_NET_DONE: u32 = 1 << 7;
/// The peer has the data (write acked, or read answered).
pub const RQ_NET_OK: u32 = 1 << 8;
/// Write request.
pub const RQ_WRITE: u32 = 1 << 9;
/// Read-ahead request.
pub const RQ_READA: u32 = 1 << 10;

const RQ_LOCAL_MASK: u32 = RQ_LOCAL_PENDING | RQ_LOCAL_COMPLETED | RQ_LOCAL_OK | RQ_LOCAL_ABORTED;

/// Events driving the request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqEvent {
    /// Sender gave up because the connection is going away.
    SendCanceled,
    /// Transport refused the packet.
    SendFailed,
    /// Data or read request handed to the transport.
    HandedOverToNetwork,
    /// Out-of-sync notice handed to the transport.
    OosHandedToNetwork,
    /// Local I/O succeeded.
    CompletedOk,
    /// Local write failed.
    WriteCompletedWithError,
    /// Local read failed.
    ReadCompletedWithError,
    /// Local read-ahead failed.
    ReadAheadCompletedWithError,
    /// Peer acknowledged the write.
    WriteAckedByPeer,
    /// Peer refused the write or the read.
    NegAcked,
    /// Peer answered a read with data.
    DataReceived,
    /// Local I/O given up on; the application sees an error.
    AbortDiskIo,
    /// Resubmit a request whose local I/O completed with an error.
    RestartFrozenDiskIo,
    /// A failed local read is retried from the peer.
    RetryReadFromPeer,
}

/// One application I/O.
#[derive(Debug)]
pub struct LocalRequest {
    /// Start sector.
    pub sector: Sector,
    /// Length in bytes.
    pub size: u32,
    /// Transfer-log epoch the request was queued in.
    pub epoch: u32,
    /// `RQ_*` bits.
    pub rq_state: u32,
    /// Write payload, or read data once available.
    pub data: Option<Bytes>,
    master: Option<oneshot::Sender<ReplResult<Bytes>>>,
}

impl LocalRequest {
    /// New write request carrying `data`.
    pub fn new_write(sector: Sector, data: Bytes, epoch: u32) -> (Self, IoReceiver) {
        let (tx, rx) = oneshot::channel();
        let req = Self {
            sector,
            size: data.len() as u32,
            epoch,
            rq_state: RQ_WRITE,
            data: Some(data),
            master: Some(tx),
        };
        (req, rx)
    }

    /// New read request.
    pub fn new_read(sector: Sector, size: u32, epoch: u32, read_ahead: bool) -> (Self, IoReceiver) {
        let (tx, rx) = oneshot::channel();
        let req = Self {
            sector,
            size,
            epoch,
            rq_state: if read_ahead { RQ_READA } else { 0 },
            data: None,
            master: Some(tx),
        };
        (req, rx)
    }

    /// Write request.
    pub fn is_write(&self) -> bool {
        self.rq_state & RQ_WRITE != 0
    }

    /// Test one or more `RQ_*` bits (all must be set).
    pub fn has(&self, bits: u32) -> bool {
        self.rq_state & bits == bits
    }

    /// Clear then set `RQ_*` bits directly.
    pub fn modify(&mut self, clear: u32, set: u32) {
        self.rq_state = (self.rq_state & !clear) | set;
    }

    /// Apply one event to the state bits.
    pub fn apply(&mut self, event: ReqEvent) {
        match event {
            ReqEvent::SendCanceled | ReqEvent::SendFailed => {
                self.modify(RQ_NET_QUEUED | RQ_NET_PENDING, RQ_NET_DONE)
            }
            ReqEvent::HandedOverToNetwork => self.modify(RQ_NET_QUEUED, RQ_NET_SENT),
            ReqEvent::OosHandedToNetwork => self.modify(RQ_NET_QUEUED, RQ_NET_DONE),
            ReqEvent::CompletedOk => {
                self.modify(RQ_LOCAL_PENDING, RQ_LOCAL_COMPLETED | RQ_LOCAL_OK)
            }
            ReqEvent::WriteCompletedWithError
            | ReqEvent::ReadCompletedWithError
            | ReqEvent::ReadAheadCompletedWithError => {
                self.modify(RQ_LOCAL_PENDING, RQ_LOCAL_COMPLETED)
            }
            ReqEvent::WriteAckedByPeer | ReqEvent::DataReceived => {
                self.modify(RQ_NET_PENDING | RQ_NET_QUEUED, RQ_NET_OK | RQ_NET_DONE)
            }
            ReqEvent::NegAcked => self.modify(RQ_NET_PENDING | RQ_NET_QUEUED, RQ_NET_DONE),
            ReqEvent::AbortDiskIo => {
                if self.has(RQ_LOCAL_PENDING) {
                    self.modify(0, RQ_LOCAL_ABORTED);
                }
            }
            ReqEvent::RestartFrozenDiskIo => {
                if self.has(RQ_LOCAL_COMPLETED) {
                    self.modify(RQ_LOCAL_MASK, RQ_LOCAL_PENDING);
                }
            }
            ReqEvent::RetryReadFromPeer => {
                self.modify(RQ_NET_DONE | RQ_NET_OK, RQ_NET_QUEUED | RQ_NET_PENDING)
            }
        }
    }

    /// Local side has nothing more to do for the application.
    fn local_settled(&self) -> bool {
        !self.has(RQ_LOCAL_PENDING) || self.has(RQ_LOCAL_ABORTED)
    }

    /// Network side has nothing more to do.
    fn net_settled(&self) -> bool {
        self.rq_state & (RQ_NET_QUEUED | RQ_NET_PENDING) == 0
    }

    /// The application I/O can be completed now.
    pub fn master_ready(&self) -> bool {
        self.master.is_some() && self.local_settled() && self.net_settled()
    }

    /// Outcome the application sees.
    pub fn master_result(&self) -> Option<Bytes> {
        let ok = (self.has(RQ_LOCAL_OK) && !self.has(RQ_LOCAL_ABORTED)) || self.has(RQ_NET_OK);
        if !ok {
            return None;
        }
        if self.is_write() {
            Some(Bytes::new())
        } else {
            Some(self.data.clone().unwrap_or_default())
        }
    }

    /// Complete the application I/O. Returns false if it was already done.
    pub fn complete_master(&mut self, result: ReplResult<Bytes>) -> bool {
        match self.master.take() {
            Some(tx) => {
                // the application may have stopped waiting
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Master completed and neither side holds the request any longer.
    pub fn can_destroy(&self) -> bool {
        self.master.is_none() && !self.has(RQ_LOCAL_PENDING) && self.net_settled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirrored_write() -> LocalRequest {
        let (mut req, _rx) = LocalRequest::new_write(8, Bytes::from_static(b"abcd"), 1);
        req.modify(0, RQ_LOCAL_PENDING | RQ_NET_QUEUED | RQ_NET_PENDING);
        req
    }

    #[test]
    fn test_write_completes_after_local_and_ack() {
        let mut req = mirrored_write();
        req.apply(ReqEvent::CompletedOk);
        assert!(!req.master_ready());
        req.apply(ReqEvent::HandedOverToNetwork);
        assert!(req.has(RQ_NET_SENT | RQ_NET_PENDING));
        assert!(!req.master_ready());
        req.apply(ReqEvent::WriteAckedByPeer);
        assert!(req.master_ready());
        assert_eq!(req.master_result(), Some(Bytes::new()));
        assert!(req.complete_master(Ok(Bytes::new())));
        assert!(!req.complete_master(Ok(Bytes::new())));
        assert!(req.can_destroy());
    }

    #[test]
    fn test_write_ok_if_only_peer_has_it() {
        let mut req = mirrored_write();
        req.apply(ReqEvent::WriteCompletedWithError);
        req.apply(ReqEvent::HandedOverToNetwork);
        req.apply(ReqEvent::WriteAckedByPeer);
        assert!(req.master_ready());
        assert!(req.master_result().is_some());
    }

    #[test]
    fn test_write_fails_if_nobody_has_it() {
        let mut req = mirrored_write();
        req.apply(ReqEvent::WriteCompletedWithError);
        req.apply(ReqEvent::SendCanceled);
        assert!(req.master_ready());
        assert!(req.master_result().is_none());
    }

    #[test]
    fn test_aborted_request_completes_master_early() {
        let (mut req, _rx) = LocalRequest::new_read(0, 4096, 0, false);
        req.modify(0, RQ_LOCAL_PENDING);
        req.apply(ReqEvent::AbortDiskIo);
        assert!(req.master_ready());
        assert!(req.master_result().is_none());
        req.complete_master(Ok(Bytes::new()));
        // still waiting for the late completion
        assert!(!req.can_destroy());
        req.apply(ReqEvent::ReadCompletedWithError);
        assert!(req.can_destroy());
    }

    #[test]
    fn test_read_retry_from_peer() {
        let (mut req, _rx) = LocalRequest::new_read(0, 4096, 0, false);
        req.modify(0, RQ_LOCAL_PENDING);
        req.apply(ReqEvent::ReadCompletedWithError);
        req.apply(ReqEvent::RetryReadFromPeer);
        assert!(!req.master_ready());
        req.apply(ReqEvent::HandedOverToNetwork);
        req.data = Some(Bytes::from_static(b"peer"));
        req.apply(ReqEvent::DataReceived);
        assert!(req.master_ready());
        assert_eq!(req.master_result(), Some(Bytes::from_static(b"peer")));
    }

    #[test]
    fn test_restart_only_after_local_completion() {
        let mut req = mirrored_write();
        req.apply(ReqEvent::RestartFrozenDiskIo);
        assert!(req.has(RQ_LOCAL_PENDING));
        assert!(!req.has(RQ_LOCAL_COMPLETED));
        req.apply(ReqEvent::WriteCompletedWithError);
        req.apply(ReqEvent::RestartFrozenDiskIo);
        assert!(req.has(RQ_LOCAL_PENDING));
        assert!(!req.has(RQ_LOCAL_COMPLETED));
    }

    #[test]
    fn test_out_of_sync_notice() {
        let (mut req, _rx) = LocalRequest::new_write(0, Bytes::from_static(b"x"), 0);
        req.modify(0, RQ_LOCAL_PENDING | RQ_NET_QUEUED);
        req.apply(ReqEvent::OosHandedToNetwork);
        req.apply(ReqEvent::CompletedOk);
        assert!(req.master_ready());
        assert!(!req.has(RQ_NET_OK));
    }
}
