//! The sender loop and the work items that talk to the peer.
//!
//! One task per connection pops [`WorkItem`]s and runs them in order. When
//! the queue runs dry the loop closes an idle epoch with a barrier, uncorks
//! the socket and sleeps. Device work flagged from completion context
//! (progress reports, resync done, metadata sync) runs between items.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::device::{Device, MD_SYNC, RS_DONE, RS_PROGRESS};
use crate::block_io::IoDir;
use crate::error::{ReplError, ReplResult};
use crate::request::{ReqEvent, ReqHandle, RQ_READA};
use crate::state::ConnState;
use crate::transport::Packet;
use crate::work::WorkItem;

/// What a send work item needs from its request.
struct Outgoing {
    sector: u64,
    size: u32,
    epoch: u32,
    data: Bytes,
}

impl Connection {
    fn outgoing(&self, device: &Device, handle: ReqHandle) -> Option<Outgoing> {
        let inner = device.lock();
        inner.requests.get(handle).map(|req| Outgoing {
            sector: req.sector,
            size: req.size,
            epoch: req.epoch,
            data: req.data.clone().unwrap_or_default(),
        })
    }

    /// Mirror a write to the peer.
    pub(crate) fn w_send_dblock(&self, vnr: u32, handle: ReqHandle, cancel: bool) -> ReplResult<()> {
        let device = self.device(vnr)?;
        if cancel {
            return self.req_mod(&device, handle, ReqEvent::SendCanceled);
        }
        let Some(out) = self.outgoing(&device, handle) else {
            debug!("minor {}: write gone before send", device.minor);
            return Ok(());
        };
        let result = {
            let mut send = self.send.lock();
            send.begin_data(self.transport.as_ref(), out.epoch).and_then(|()| {
                self.transport.send(Packet::Data {
                    vnr,
                    sector: out.sector,
                    block_id: handle.to_raw(),
                    data: out.data,
                })
            })
        };
        match result {
            Ok(()) => self.req_mod(&device, handle, ReqEvent::HandedOverToNetwork),
            Err(e) => {
                self.req_mod(&device, handle, ReqEvent::SendFailed)?;
                Err(e)
            }
        }
    }

    /// Tell the peer a written range is out of sync (Ahead mode).
    pub(crate) fn w_send_out_of_sync(&self, vnr: u32, handle: ReqHandle, cancel: bool) -> ReplResult<()> {
        let device = self.device(vnr)?;
        if cancel {
            return self.req_mod(&device, handle, ReqEvent::SendCanceled);
        }
        let Some(out) = self.outgoing(&device, handle) else {
            return Ok(());
        };
        let result = {
            let mut send = self.send.lock();
            send.maybe_send_barrier(self.transport.as_ref(), out.epoch)
                .and_then(|()| {
                    self.transport.send(Packet::OutOfSync {
                        vnr,
                        sector: out.sector,
                        size: out.size,
                    })
                })
        };
        self.req_mod(&device, handle, ReqEvent::OosHandedToNetwork)?;
        result
    }

    /// Ask the peer for the data of an application read.
    pub(crate) fn w_send_read_req(&self, vnr: u32, handle: ReqHandle, cancel: bool) -> ReplResult<()> {
        let device = self.device(vnr)?;
        if cancel {
            return self.req_mod(&device, handle, ReqEvent::SendCanceled);
        }
        let Some(out) = self.outgoing(&device, handle) else {
            return Ok(());
        };
        let result = {
            let mut send = self.send.lock();
            send.maybe_send_barrier(self.transport.as_ref(), out.epoch)
                .and_then(|()| {
                    self.transport.send(Packet::DataRequest {
                        vnr,
                        sector: out.sector,
                        size: out.size,
                        block_id: handle.to_raw(),
                    })
                })
        };
        match result {
            Ok(()) => self.req_mod(&device, handle, ReqEvent::HandedOverToNetwork),
            Err(e) => {
                self.req_mod(&device, handle, ReqEvent::SendFailed)?;
                Err(e)
            }
        }
    }

    /// Resubmit the local part of a request.
    pub(crate) fn w_restart_disk_io(&self, vnr: u32, handle: ReqHandle) -> ReplResult<()> {
        let device = self.device(vnr)?;
        let (dir, sector, size, data) = {
            let inner = device.lock();
            let req = inner.requests.get(handle).ok_or(ReplError::StaleHandle)?;
            let dir = if req.is_write() {
                IoDir::Write
            } else if req.has(RQ_READA) {
                IoDir::ReadAhead
            } else {
                IoDir::Read
            };
            let data = if req.is_write() { req.data.clone() } else { None };
            (dir, req.sector, req.size, data)
        };
        info!("minor {}: restarting local I/O at sector {}", device.minor, sector);
        self.submit_local(&device, handle, dir, sector, size, data);
        Ok(())
    }

    // ---- idle handling ----

    /// True while the announced epoch lags behind the transfer log.
    fn idle_barrier_due(&self) -> bool {
        let send = self.send.lock();
        send.seen_any_write_yet() && self.current_tle_nr() != send.current_epoch_nr()
    }

    /// Close the announced epoch so the peer can acknowledge it.
    fn send_idle_barrier(&self) {
        let result = {
            let mut send = self.send.lock();
            let next = send.current_epoch_nr().wrapping_add(1);
            send.maybe_send_barrier(self.transport.as_ref(), next)
        };
        if let Err(e) = result {
            self.request_network_failure(&e);
        }
    }

    /// Block until work shows up, moving it into `batch`.
    async fn wait_for_work(&self, batch: &mut VecDeque<WorkItem>) {
        if self.work.dequeue_batch(batch) {
            return;
        }
        if self.net_conf.tcp_cork {
            self.transport.set_cork(false);
        }
        loop {
            let notified = self.work.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let send_barrier = self.work.with_locked(|q| {
                if !q.is_empty() {
                    batch.extend(q.drain(..));
                    return None;
                }
                Some(self.idle_barrier_due())
            });
            let Some(send_barrier) = send_barrier else {
                break;
            };
            if send_barrier {
                self.send_idle_barrier();
            }
            if self.work.device_work_pending() || !self.is_running() {
                break;
            }
            notified.await;
        }
        if self.net_conf.tcp_cork {
            self.transport.set_cork(true);
        }
    }

    /// Run the device work flagged from completion context.
    pub(crate) async fn do_unqueued_work(&self) {
        if !self.work.take_device_work() {
            return;
        }
        for device in self.devices() {
            let todo = device.take_work();
            if todo & MD_SYNC != 0 {
                if let Err(e) = device.md_sync() {
                    error!("minor {}: metadata sync failed: {}", device.minor, e);
                }
            }
            if todo & RS_PROGRESS != 0 {
                device.report_progress();
            }
            if todo & RS_DONE != 0 {
                if let Err(e) = self.resync_finished(&device).await {
                    warn!("minor {}: finishing resync failed: {}", device.minor, e);
                }
            }
        }
    }

    async fn execute_item(&self, item: WorkItem, cancel: bool) {
        let name = item.name();
        if let Err(e) = item.execute(self, cancel).await {
            if e.is_transient() {
                debug!("work {}: {}", name, e);
                return;
            }
            warn!("work {} failed: {}", name, e);
            self.request_network_failure(&e);
        }
    }

    /// Drive the connection once without background tasks: acks for
    /// completed peer writes, device work, every queued item (including
    /// what they queue), then the idle barrier. Returns the number of items
    /// executed.
    pub async fn run_pending(&self) -> ReplResult<usize> {
        let mut ran = 0;
        let mut batch = VecDeque::new();
        loop {
            self.process_done_ee()?;
            self.do_unqueued_work().await;
            if !self.work.dequeue_batch(&mut batch) {
                break;
            }
            let cancel = self.cstate() < ConnState::WfReportParams;
            while let Some(item) = batch.pop_front() {
                self.execute_item(item, cancel).await;
                ran += 1;
            }
        }
        if self.idle_barrier_due() {
            self.send_idle_barrier();
        }
        Ok(ran)
    }

    /// Body of the sender task.
    pub(crate) async fn run_sender(self: Arc<Self>) {
        info!("sender started");
        let mut batch = VecDeque::new();
        while self.is_running() {
            if batch.is_empty() {
                self.wait_for_work(&mut batch).await;
            }
            self.do_unqueued_work().await;
            if !self.is_running() {
                break;
            }
            let cancel = self.cstate() < ConnState::WfReportParams;
            while let Some(item) = batch.pop_front() {
                self.execute_item(item, cancel).await;
            }
        }

        // drain: release everything still queued without touching the network
        loop {
            self.do_unqueued_work().await;
            while let Some(item) = batch.pop_front() {
                self.execute_item(item, true).await;
            }
            if !self.work.dequeue_batch(&mut batch) {
                break;
            }
        }
        info!("sender terminated");
    }
}
