//! Transport collaborator: packet vocabulary and the send-side interface.
//!
//! The worker never touches sockets. It hands [`Packet`]s to a [`Transport`]
//! and asks it how full the send buffer is. [`LoopbackTransport`] queues
//! packets in memory so tests (and the simulator) can play the peer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bitmap::Sector;
use crate::error::{ReplError, ReplResult};

/// Block id used for resync traffic instead of a request token.
pub const ID_SYNCER: u64 = u64::MAX;
/// Verify result: block is in sync.
pub const ID_IN_SYNC: u64 = 4711;
/// Verify result: block is out of sync.
pub const ID_OUT_OF_SYNC: u64 = 4712;

/// Everything the worker sends to or receives from the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Closes write epoch `barrier`.
    Barrier {
        /// Epoch number being closed.
        barrier: u32,
    },
    /// Peer has completed every write of epoch `barrier`.
    BarrierAck {
        /// Epoch number acknowledged.
        barrier: u32,
        /// Number of writes the peer saw in that epoch.
        set_size: u32,
    },
    /// Mirrored application write.
    Data {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Request token echoed in the ack.
        block_id: u64,
        /// Payload.
        data: Bytes,
    },
    /// Range written locally while in Ahead mode, not mirrored.
    OutOfSync {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
    },
    /// Application read served by the peer.
    DataRequest {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
        /// Request token echoed in the reply.
        block_id: u64,
    },
    /// Answer to [`Packet::DataRequest`].
    DataReply {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Request token.
        block_id: u64,
        /// Payload.
        data: Bytes,
    },
    /// Failed answer to [`Packet::DataRequest`].
    NegDReply {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
        /// Request token.
        block_id: u64,
    },
    /// Sync target asks for a block.
    RsDataRequest {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
        /// Always [`ID_SYNCER`].
        block_id: u64,
    },
    /// Resync data from the sync source.
    RsDataReply {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Always [`ID_SYNCER`].
        block_id: u64,
        /// Payload.
        data: Bytes,
    },
    /// Sync source could not read the block.
    NegRsDReply {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
    },
    /// Sync source refuses resync data while in Ahead mode.
    RsCancel {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
    },
    /// Sync target asks the source to compare a checksum.
    CsumRsRequest {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
        /// Digest of the target's copy.
        digest: Vec<u8>,
    },
    /// Checksums matched, nothing to transfer.
    RsIsInSync {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
    },
    /// Sync target wrote resync data.
    RsWriteAck {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
    },
    /// Verify initiator asks for the digest of a block.
    OvRequest {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
        /// Where the run ends, if it does not cover the whole device.
        stop: Option<Sector>,
    },
    /// Digest of the responder's copy.
    OvReply {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
        /// Digest of the responder's copy.
        digest: Vec<u8>,
    },
    /// Verify initiator's comparison result.
    OvResult {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
        /// [`ID_IN_SYNC`] or [`ID_OUT_OF_SYNC`].
        block_id: u64,
    },
    /// Peer wrote a mirrored block.
    WriteAck {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
        /// Request token.
        block_id: u64,
    },
    /// Peer failed to write a mirrored block.
    NegAck {
        /// Volume number.
        vnr: u32,
        /// Start sector.
        sector: Sector,
        /// Length in bytes.
        size: u32,
        /// Request token.
        block_id: u64,
    },
    /// Liveness check.
    Ping,
    /// Answer to [`Packet::Ping`].
    PingAck,
}

impl Packet {
    /// Short packet name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Barrier { .. } => "Barrier",
            Packet::BarrierAck { .. } => "BarrierAck",
            Packet::Data { .. } => "Data",
            Packet::OutOfSync { .. } => "OutOfSync",
            Packet::DataRequest { .. } => "DataRequest",
            Packet::DataReply { .. } => "DataReply",
            Packet::NegDReply { .. } => "NegDReply",
            Packet::RsDataRequest { .. } => "RsDataRequest",
            Packet::RsDataReply { .. } => "RsDataReply",
            Packet::NegRsDReply { .. } => "NegRsDReply",
            Packet::RsCancel { .. } => "RsCancel",
            Packet::CsumRsRequest { .. } => "CsumRsRequest",
            Packet::RsIsInSync { .. } => "RsIsInSync",
            Packet::RsWriteAck { .. } => "RsWriteAck",
            Packet::OvRequest { .. } => "OvRequest",
            Packet::OvReply { .. } => "OvReply",
            Packet::OvResult { .. } => "OvResult",
            Packet::WriteAck { .. } => "WriteAck",
            Packet::NegAck { .. } => "NegAck",
            Packet::Ping => "Ping",
            Packet::PingAck => "PingAck",
        }
    }
}

/// Send buffer fill level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendBufferUsage {
    /// Bytes queued but not yet on the wire.
    pub queued: usize,
    /// Configured send buffer size.
    pub capacity: usize,
}

impl SendBufferUsage {
    /// More than half of the send buffer is in use.
    pub fn over_half_full(&self) -> bool {
        self.queued > self.capacity / 2
    }
}

/// Send side of a peer connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a packet for sending.
    fn send(&self, packet: Packet) -> ReplResult<()>;

    /// Current send buffer usage, or None if there is no socket.
    fn send_buffer(&self) -> Option<SendBufferUsage>;

    /// Cork (batch) or uncork the socket.
    fn set_cork(&self, _cork: bool) {}

    /// Send a ping and wait for the ack.
    async fn ping(&self) -> ReplResult<()>;
}

/// In-memory transport: sent packets are queued until the peer side takes them.
pub struct LoopbackTransport {
    outbox: Mutex<VecDeque<Packet>>,
    queued_bytes: AtomicUsize,
    capacity: usize,
    connected: AtomicBool,
    corked: AtomicBool,
    failing_sends: AtomicU32,
    packets_sent: AtomicU64,
    pings: AtomicU64,
}

impl LoopbackTransport {
    /// Create a connected loopback with the given send buffer size.
    pub fn new(capacity: usize) -> Self {
        Self {
            outbox: Mutex::new(VecDeque::new()),
            queued_bytes: AtomicUsize::new(0),
            capacity,
            connected: AtomicBool::new(true),
            corked: AtomicBool::new(false),
            failing_sends: AtomicU32::new(0),
            packets_sent: AtomicU64::new(0),
            pings: AtomicU64::new(0),
        }
    }

    /// Drain everything sent so far, emptying the send buffer.
    pub fn take_sent(&self) -> Vec<Packet> {
        let mut outbox = self.outbox.lock();
        self.queued_bytes.store(0, Ordering::Release);
        outbox.drain(..).collect()
    }

    /// Copy of everything sent but not yet taken.
    pub fn pending(&self) -> Vec<Packet> {
        self.outbox.lock().iter().cloned().collect()
    }

    /// Simulate the socket going away (or coming back).
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::Release);
    }

    /// Whether the socket is currently corked.
    pub fn is_corked(&self) -> bool {
        self.corked.load(Ordering::Acquire)
    }

    /// Total packets accepted.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Total pings answered.
    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn send(&self, packet: Packet) -> ReplResult<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ReplError::NetworkSend {
                msg: format!("no socket for {}", packet.name()),
            });
        }
        let failing = self.failing_sends.load(Ordering::Acquire);
        if failing > 0 {
            self.failing_sends.store(failing - 1, Ordering::Release);
            return Err(ReplError::NetworkSend {
                msg: format!("injected failure sending {}", packet.name()),
            });
        }
        let size = bincode::serialized_size(&packet)? as usize;
        self.outbox.lock().push_back(packet);
        self.queued_bytes.fetch_add(size, Ordering::AcqRel);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_buffer(&self) -> Option<SendBufferUsage> {
        if !self.connected.load(Ordering::Acquire) {
            return None;
        }
        Some(SendBufferUsage {
            queued: self.queued_bytes.load(Ordering::Acquire),
            capacity: self.capacity,
        })
    }

    fn set_cork(&self, cork: bool) {
        self.corked.store(cork, Ordering::Release);
    }

    async fn ping(&self) -> ReplResult<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ReplError::Disconnected);
        }
        self.pings.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_take() {
        let t = LoopbackTransport::new(1 << 20);
        t.send(Packet::Barrier { barrier: 7 }).unwrap();
        t.send(Packet::Ping).unwrap();
        assert_eq!(t.packets_sent(), 2);
        assert!(t.send_buffer().unwrap().queued > 0);
        let sent = t.take_sent();
        assert_eq!(sent, vec![Packet::Barrier { barrier: 7 }, Packet::Ping]);
        assert_eq!(t.send_buffer().unwrap().queued, 0);
    }

    #[test]
    fn test_send_buffer_fills() {
        let t = LoopbackTransport::new(8192);
        t.send(Packet::RsDataReply {
            vnr: 0,
            sector: 0,
            block_id: ID_SYNCER,
            data: Bytes::from(vec![0u8; 4096]),
        })
        .unwrap();
        let usage = t.send_buffer().unwrap();
        assert!(usage.over_half_full());
    }

    #[test]
    fn test_disconnected_send_fails() {
        let t = LoopbackTransport::new(1024);
        t.set_connected(false);
        assert!(t.send_buffer().is_none());
        let err = t.send(Packet::Ping).unwrap_err();
        assert!(matches!(err, ReplError::NetworkSend { .. }));
    }

    #[test]
    fn test_injected_failures() {
        let t = LoopbackTransport::new(1024);
        t.fail_next_sends(1);
        assert!(t.send(Packet::Ping).is_err());
        assert!(t.send(Packet::Ping).is_ok());
    }

    #[tokio::test]
    async fn test_ping() {
        let t = LoopbackTransport::new(1024);
        t.ping().await.unwrap();
        assert_eq!(t.pings(), 1);
        t.set_connected(false);
        assert!(matches!(t.ping().await, Err(ReplError::Disconnected)));
    }

    #[test]
    fn test_cork_flag() {
        let t = LoopbackTransport::new(1024);
        t.set_cork(true);
        assert!(t.is_corked());
        t.set_cork(false);
        assert!(!t.is_corked());
    }
}
