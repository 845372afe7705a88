//! Deferred work for the sender loop.
//!
//! Producers (completion handlers, the resync timer, the request path) push
//! [`WorkItem`]s; the sender task of the connection pops and executes them
//! one at a time, in order. Restarting frozen disk I/O goes to the front.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::connection::Connection;
use crate::error::ReplResult;
use crate::peer_request::PeerReqHandle;
use crate::request::ReqHandle;

/// One unit of deferred work.
#[derive(Debug)]
pub enum WorkItem {
    /// Send a mirrored write to the peer.
    SendDblock {
        /// Volume number.
        vnr: u32,
        /// Request to send.
        req: ReqHandle,
    },
    /// Tell the peer a range went out of sync (Ahead mode).
    SendOutOfSync {
        /// Volume number.
        vnr: u32,
        /// Request whose range is reported.
        req: ReqHandle,
    },
    /// Ask the peer for data of an application read.
    SendReadReq {
        /// Volume number.
        vnr: u32,
        /// Read request.
        req: ReqHandle,
    },
    /// Resubmit the local I/O of a request.
    RestartDiskIo {
        /// Volume number.
        vnr: u32,
        /// Request to resubmit.
        req: ReqHandle,
    },
    /// Resync timer expired: generate the next batch of requests.
    ResyncTimer {
        /// Volume number.
        vnr: u32,
    },
    /// Retry finishing a resync.
    ResyncFinished {
        /// Volume number.
        vnr: u32,
    },
    /// Online verify saw its last result.
    OvFinished {
        /// Volume number.
        vnr: u32,
    },
    /// Peer request whose local I/O completed.
    PeerReq {
        /// Volume number.
        vnr: u32,
        /// The peer request.
        req: PeerReqHandle,
    },
    /// Signals that everything queued before it has run.
    Flush(oneshot::Sender<()>),
}

impl WorkItem {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            WorkItem::SendDblock { .. } => "send_dblock",
            WorkItem::SendOutOfSync { .. } => "send_out_of_sync",
            WorkItem::SendReadReq { .. } => "send_read_req",
            WorkItem::RestartDiskIo { .. } => "restart_disk_io",
            WorkItem::ResyncTimer { .. } => "resync_timer",
            WorkItem::ResyncFinished { .. } => "resync_finished",
            WorkItem::OvFinished { .. } => "ov_finished",
            WorkItem::PeerReq { .. } => "peer_req",
            WorkItem::Flush(_) => "flush",
        }
    }

    /// Run the item. With `cancel` set the connection is going away: the
    /// item releases what it holds without touching the network.
    pub async fn execute(self, conn: &Connection, cancel: bool) -> ReplResult<()> {
        debug!("work: {} cancel={}", self.name(), cancel);
        match self {
            WorkItem::SendDblock { vnr, req } => conn.w_send_dblock(vnr, req, cancel),
            WorkItem::SendOutOfSync { vnr, req } => conn.w_send_out_of_sync(vnr, req, cancel),
            WorkItem::SendReadReq { vnr, req } => conn.w_send_read_req(vnr, req, cancel),
            WorkItem::RestartDiskIo { vnr, req } => conn.w_restart_disk_io(vnr, req),
            WorkItem::ResyncTimer { vnr } => conn.w_resync_timer(vnr, cancel).await,
            WorkItem::ResyncFinished { vnr } => {
                if cancel {
                    return Ok(());
                }
                let device = conn.device(vnr)?;
                conn.resync_finished(&device).await
            }
            WorkItem::OvFinished { vnr } => conn.w_ov_finished(vnr, cancel).await,
            WorkItem::PeerReq { vnr, req } => conn.w_peer_req(vnr, req, cancel),
            WorkItem::Flush(done) => {
                // the waiter may be gone
                let _ = done.send(());
                Ok(())
            }
        }
    }
}

/// FIFO of work items with a wakeup for the single consumer.
#[derive(Debug, Default)]
pub struct WorkQueue {
    q: Mutex<VecDeque<WorkItem>>,
    notify: Notify,
    device_work_pending: AtomicBool,
}

impl WorkQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item and wake the consumer.
    pub fn push(&self, item: WorkItem) {
        self.q.lock().push_back(item);
        self.notify.notify_one();
    }

    /// Put an item at the head of the queue.
    pub fn push_front(&self, item: WorkItem) {
        self.q.lock().push_front(item);
        self.notify.notify_one();
    }

    /// Move everything queued into `batch`. Returns whether anything moved.
    pub fn dequeue_batch(&self, batch: &mut VecDeque<WorkItem>) -> bool {
        let mut q = self.q.lock();
        if q.is_empty() {
            return false;
        }
        batch.extend(q.drain(..));
        true
    }

    /// Run `f` with the queue locked; `f` sees whether the queue is empty.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut VecDeque<WorkItem>) -> R) -> R {
        f(&mut self.q.lock())
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.q.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }

    /// Flag device work (handled outside the queue) and wake the consumer.
    pub fn signal_device_work(&self) {
        self.device_work_pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Whether device work is flagged.
    pub fn device_work_pending(&self) -> bool {
        self.device_work_pending.load(Ordering::Acquire)
    }

    /// Clear and return the device work flag.
    pub fn take_device_work(&self) -> bool {
        self.device_work_pending.swap(false, Ordering::AcqRel)
    }

    /// Wake the consumer without queueing anything.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// The consumer's wakeup.
    pub fn notify(&self) -> &Notify {
        &self.notify
    }
}
