//! Per-connection send state for write epochs and barriers.
//!
//! Every mirrored write belongs to a transfer-log epoch. The sender tells
//! the peer where one epoch ends by sending a barrier before the first
//! packet of the next epoch. Epochs without writes are never closed with a
//! barrier.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{ReplError, ReplResult};
use crate::transport::{Packet, Transport};

/// What the sender last announced to the peer.
#[derive(Debug, Default)]
pub struct SendState {
    seen_any_write_yet: bool,
    current_epoch_nr: u32,
    current_epoch_writes: u32,
    /// Barriers sent and not yet acknowledged: epoch -> writes in it.
    unacked_barriers: BTreeMap<u32, u32>,
}

impl SendState {
    /// Fresh state for a new connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any write was sent on this connection yet.
    pub fn seen_any_write_yet(&self) -> bool {
        self.seen_any_write_yet
    }

    /// Epoch last announced to the peer.
    pub fn current_epoch_nr(&self) -> u32 {
        self.current_epoch_nr
    }

    /// Writes sent in the current epoch.
    pub fn current_epoch_writes(&self) -> u32 {
        self.current_epoch_writes
    }

    /// The first write on a connection establishes the baseline epoch.
    pub fn re_init_if_first_write(&mut self, epoch: u32) {
        if !self.seen_any_write_yet {
            self.seen_any_write_yet = true;
            self.current_epoch_nr = epoch;
            self.current_epoch_writes = 0;
        }
    }

    /// Close the announced epoch if `epoch` differs from it. A barrier is
    /// only sent when the closed epoch carried writes.
    pub fn maybe_send_barrier(&mut self, transport: &dyn Transport, epoch: u32) -> ReplResult<()> {
        if !self.seen_any_write_yet {
            return Ok(());
        }
        if self.current_epoch_nr != epoch {
            if self.current_epoch_writes > 0 {
                self.send_barrier(transport)?;
            }
            self.current_epoch_nr = epoch;
        }
        Ok(())
    }

    fn send_barrier(&mut self, transport: &dyn Transport) -> ReplResult<()> {
        let barrier = self.current_epoch_nr;
        debug!(
            "sending barrier {} ({} writes)",
            barrier, self.current_epoch_writes
        );
        transport.send(Packet::Barrier { barrier })?;
        self.unacked_barriers
            .insert(barrier, self.current_epoch_writes);
        self.current_epoch_writes = 0;
        Ok(())
    }

    /// Prepare to send a data block of `epoch`: establish the baseline,
    /// close the previous epoch if needed, and count the write.
    pub fn begin_data(&mut self, transport: &dyn Transport, epoch: u32) -> ReplResult<()> {
        self.re_init_if_first_write(epoch);
        self.maybe_send_barrier(transport, epoch)?;
        self.current_epoch_writes += 1;
        Ok(())
    }

    /// Check a barrier ack against the writes sent in that epoch.
    pub fn barrier_acked(&mut self, barrier: u32, set_size: u32) -> ReplResult<()> {
        match self.unacked_barriers.remove(&barrier) {
            Some(writes) if writes == set_size => {
                // acks arrive in order; anything older is implicitly done
                self.unacked_barriers.retain(|nr, _| *nr > barrier);
                Ok(())
            }
            Some(writes) => Err(ReplError::ProtocolViolation {
                msg: format!(
                    "BarrierAck #{} received with n_writes={}, expected n_writes={}",
                    barrier, set_size, writes
                ),
            }),
            None => Err(ReplError::ProtocolViolation {
                msg: format!("BarrierAck #{} for unknown epoch", barrier),
            }),
        }
    }

    /// Barriers sent and not acknowledged yet.
    pub fn unacked_barriers(&self) -> usize {
        self.unacked_barriers.len()
    }
}
