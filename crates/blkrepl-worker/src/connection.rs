//! A connection to one peer and the devices replicated over it.
//!
//! The connection owns the work queue, the send state and the epoch
//! counters. Application I/O enters through [`Connection::submit_write`]
//! and [`Connection::submit_read`]; block-layer completions come back
//! through [`Connection::io_complete`] and peer packets through
//! [`Connection::receive`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bitmap::{out_of_sync_bit_range, Sector};
use crate::block_io::{BlockIoRequest, IoDir, IoToken};
use crate::config::NetConf;
use crate::controller::SLEEP_TIME;
use crate::deps::ResyncGraph;
use crate::device::{Device, DeviceInner};
use crate::digest::{digest_by_name, Digest};
use crate::epoch::SendState;
use crate::error::{ReplError, ReplResult};
use crate::ingest::ReceiveEpoch;
use crate::peer_request::{PeerReqHandle, PeerRequest};
use crate::ratelimit::LogRateLimiter;
use crate::request::{
    IoReceiver, LocalRequest, ReqEvent, ReqHandle, RQ_LOCAL_COMPLETED, RQ_LOCAL_OK,
    RQ_LOCAL_PENDING, RQ_NET_OK, RQ_NET_PENDING, RQ_NET_QUEUED,
};
use crate::state::{ConnState, DiskState};
use crate::transport::Transport;
use crate::work::{WorkItem, WorkQueue};

/// Background tasks of a running connection.
#[derive(Debug)]
pub struct ConnectionTasks {
    sender: JoinHandle<()>,
    asender: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl ConnectionTasks {
    /// Wait for all tasks to exit after [`Connection::stop`].
    pub async fn join(self) {
        for (name, task) in [
            ("sender", self.sender),
            ("asender", self.asender),
            ("timer", self.timer),
        ] {
            if let Err(e) = task.await {
                warn!("{} task ended abnormally: {}", name, e);
            }
        }
    }
}

/// One peer connection.
pub struct Connection {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) net_conf: NetConf,
    pub(crate) csums: Option<Arc<dyn Digest>>,
    pub(crate) verify: Option<Arc<dyn Digest>>,
    devices: RwLock<BTreeMap<u32, Arc<Device>>>,
    pub(crate) graph: Arc<ResyncGraph>,
    cstate: Mutex<ConnState>,
    pub(crate) work: WorkQueue,
    pub(crate) send: Mutex<SendState>,
    current_tle_nr: AtomicU32,
    /// Writes in the open epoch. Held while a request joins an epoch and
    /// is queued, so queue order never runs behind epoch order.
    tl_writes: Mutex<u32>,
    pub(crate) rcv: Mutex<ReceiveEpoch>,
    running: AtomicBool,
    pub(crate) asender_wake: Notify,
    pub(crate) limiter: LogRateLimiter,
}

impl Connection {
    /// Create a connection over `transport`. Digest names in `net_conf`
    /// must be known.
    pub fn new(
        transport: Arc<dyn Transport>,
        net_conf: NetConf,
        graph: Arc<ResyncGraph>,
    ) -> ReplResult<Arc<Self>> {
        let lookup = |name: &Option<String>| -> ReplResult<Option<Arc<dyn Digest>>> {
            match name {
                Some(name) => digest_by_name(name)
                    .map(Some)
                    .ok_or_else(|| ReplError::UnknownDigest { name: name.clone() }),
                None => Ok(None),
            }
        };
        let csums = lookup(&net_conf.csums_alg)?;
        let verify = lookup(&net_conf.verify_alg)?;
        Ok(Arc::new(Self {
            transport,
            net_conf,
            csums,
            verify,
            devices: RwLock::new(BTreeMap::new()),
            graph,
            cstate: Mutex::new(ConnState::StandAlone),
            work: WorkQueue::new(),
            send: Mutex::new(SendState::new()),
            current_tle_nr: AtomicU32::new(1),
            tl_writes: Mutex::new(0),
            rcv: Mutex::new(ReceiveEpoch::default()),
            running: AtomicBool::new(true),
            asender_wake: Notify::new(),
            limiter: LogRateLimiter::new(),
        }))
    }

    /// Network options.
    pub fn net_conf(&self) -> &NetConf {
        &self.net_conf
    }

    /// Attach a device as volume `device.vnr`.
    pub fn add_device(&self, device: Device) -> ReplResult<Arc<Device>> {
        let device = Arc::new(device);
        self.graph.register(device.clone())?;
        self.devices.write().insert(device.vnr, device.clone());
        info!("minor {}: attached as volume {}", device.minor, device.vnr);
        Ok(device)
    }

    /// Detach volume `vnr`.
    pub fn remove_device(&self, vnr: u32) -> Option<Arc<Device>> {
        let device = self.devices.write().remove(&vnr)?;
        self.graph.unregister(device.minor);
        Some(device)
    }

    /// Volume `vnr`.
    pub fn device(&self, vnr: u32) -> ReplResult<Arc<Device>> {
        self.devices
            .read()
            .get(&vnr)
            .cloned()
            .ok_or(ReplError::UnknownDevice { vnr })
    }

    /// All volumes, by volume number.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().values().cloned().collect()
    }

    // ---- connection state ----

    /// Connection state.
    pub fn cstate(&self) -> ConnState {
        *self.cstate.lock()
    }

    /// Set the connection state.
    pub fn set_cstate(&self, cstate: ConnState) {
        let mut cur = self.cstate.lock();
        if *cur != cstate {
            info!("conn: {} -> {}", *cur, cstate);
            *cur = cstate;
        }
    }

    /// Handshake done: the connection and every volume become Connected.
    pub fn connect(&self) {
        self.set_cstate(ConnState::Connected);
        for device in self.devices() {
            device.update_state(|s| {
                if s.conn < ConnState::Connected {
                    s.conn = ConnState::Connected;
                }
            });
        }
    }

    /// An action failed while the connection looked healthy.
    pub fn request_network_failure(&self, err: &ReplError) {
        if !self.cstate().is_healthy() {
            return;
        }
        error!("conn: {}; going to NetworkFailure", err);
        self.set_cstate(ConnState::NetworkFailure);
        for device in self.devices() {
            device.update_state(|s| {
                s.conn = ConnState::NetworkFailure;
                s.pdsk = DiskState::DUnknown;
                s.peer_isp = false;
            });
        }
        self.graph.sweep();
    }

    // ---- epochs ----

    /// Transfer-log epoch new writes join.
    pub fn current_tle_nr(&self) -> u32 {
        self.current_tle_nr.load(Ordering::Acquire)
    }

    /// Close the current transfer-log epoch (flush). Empty epochs stay open.
    pub fn start_new_epoch(&self) {
        let mut writes = self.tl_writes.lock();
        self.close_epoch_locked(&mut writes);
    }

    fn close_epoch_locked(&self, writes: &mut u32) {
        if *writes == 0 {
            return;
        }
        *writes = 0;
        let nr = self.current_tle_nr.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("new transfer log epoch {}", nr);
        self.work.wake();
    }

    /// Queue a read for the peer again, in the epoch open now.
    pub(crate) fn requeue_peer_read(&self, device: &Device, handle: ReqHandle) {
        let _tl = self.tl_writes.lock();
        if let Some(req) = device.lock().requests.get_mut(handle) {
            req.epoch = self.current_tle_nr();
        }
        self.work.push(WorkItem::SendReadReq {
            vnr: device.vnr,
            req: handle,
        });
    }

    // ---- application I/O ----

    /// Write `data` at `sector` of volume `vnr`, locally and to the peer.
    pub fn submit_write(&self, vnr: u32, sector: Sector, data: Bytes) -> ReplResult<IoReceiver> {
        let device = self.device(vnr)?;
        device.check_not_fatal()?;
        let state = device.state();
        let local = state.has_ldev();
        let remote = self.cstate() >= ConnState::Connected
            && state.pdsk >= DiskState::Inconsistent
            && state.pdsk != DiskState::DUnknown;
        if !local && !remote {
            return Err(ReplError::DiskFailure { minor: device.minor });
        }
        let send_oos = remote && state.conn == ConnState::Ahead;
        let size = data.len() as u32;

        let (handle, rx) = {
            let mut tl_writes = self.tl_writes.lock();
            let (mut req, rx) = LocalRequest::new_write(sector, data.clone(), self.current_tle_nr());
            if local {
                req.modify(0, RQ_LOCAL_PENDING);
            }
            if send_oos {
                req.modify(0, RQ_NET_QUEUED);
            } else if remote {
                req.modify(0, RQ_NET_QUEUED | RQ_NET_PENDING);
            }

            let handle = {
                let mut inner = device.lock();
                let handle = inner
                    .requests
                    .try_insert(req)
                    .map_err(|_| ReplError::ResourceExhausted { what: "request slot" })?;
                if local {
                    device.al_begin_io(&mut inner, sector);
                }
                handle
            };

            if send_oos {
                device.set_out_of_sync(sector, size);
                self.work.push(WorkItem::SendOutOfSync { vnr, req: handle });
            } else if remote {
                self.work.push(WorkItem::SendDblock { vnr, req: handle });
                *tl_writes += 1;
                if *tl_writes >= self.net_conf.max_epoch_size {
                    self.close_epoch_locked(&mut tl_writes);
                }
            }
            (handle, rx)
        };

        if local {
            self.submit_local(&device, handle, IoDir::Write, sector, size, Some(data));
        }
        Ok(rx)
    }

    /// Read `size` bytes at `sector` of volume `vnr`, from the peer if the
    /// local copy cannot serve it.
    pub fn submit_read(&self, vnr: u32, sector: Sector, size: u32) -> ReplResult<IoReceiver> {
        self.submit_read_inner(vnr, sector, size, false)
    }

    /// Speculative read: a local failure is not retried.
    pub fn submit_read_ahead(&self, vnr: u32, sector: Sector, size: u32) -> ReplResult<IoReceiver> {
        self.submit_read_inner(vnr, sector, size, true)
    }

    fn submit_read_inner(
        &self,
        vnr: u32,
        sector: Sector,
        size: u32,
        read_ahead: bool,
    ) -> ReplResult<IoReceiver> {
        let device = self.device(vnr)?;
        device.check_not_fatal()?;
        let state = device.state();
        let local = self.may_do_local_read(&device, sector, size);
        let remote = self.cstate() >= ConnState::Connected && state.pdsk == DiskState::UpToDate;
        if !local && !remote {
            return Err(ReplError::DiskFailure { minor: device.minor });
        }

        let tl_writes = self.tl_writes.lock();
        let (mut req, rx) = LocalRequest::new_read(sector, size, self.current_tle_nr(), read_ahead);
        if local {
            req.modify(0, RQ_LOCAL_PENDING);
        } else {
            req.modify(0, RQ_NET_QUEUED | RQ_NET_PENDING);
        }
        let handle = device
            .lock()
            .requests
            .try_insert(req)
            .map_err(|_| ReplError::ResourceExhausted { what: "request slot" })?;
        if !local {
            self.work.push(WorkItem::SendReadReq { vnr, req: handle });
        }
        drop(tl_writes);

        if local {
            let dir = if read_ahead { IoDir::ReadAhead } else { IoDir::Read };
            self.submit_local(&device, handle, dir, sector, size, None);
        }
        Ok(rx)
    }

    fn may_do_local_read(&self, device: &Device, sector: Sector, size: u32) -> bool {
        let disk = device.state().disk;
        if disk == DiskState::UpToDate {
            return true;
        }
        if disk < DiskState::Inconsistent {
            return false;
        }
        match out_of_sync_bit_range(sector, size, device.capacity()) {
            Some((first, last)) => (first..=last).all(|bit| !device.bitmap().test_bit(bit)),
            None => false,
        }
    }

    /// Hand a local request's I/O to the backing device. A refused
    /// submission completes the request with an error.
    pub(crate) fn submit_local(
        &self,
        device: &Device,
        handle: ReqHandle,
        dir: IoDir,
        sector: Sector,
        size: u32,
        data: Option<Bytes>,
    ) {
        let io = BlockIoRequest {
            token: IoToken::Local {
                vnr: device.vnr,
                req: handle,
            },
            dir,
            sector,
            size,
            data,
        };
        if let Err(e) = device.block_io.submit(io) {
            warn!("minor {}: local submit failed: {}", device.minor, e);
            if let Err(e) = self.request_endio(device, handle, Err(std::io::Error::other(e.to_string()))) {
                error!("minor {}: {}", device.minor, e);
            }
        }
    }

    /// Park a peer request in the device's arena, ready for submission.
    /// The arena holds at most `max_buffers` requests.
    pub(crate) fn insert_peer_request(
        &self,
        device: &Device,
        mut req: PeerRequest,
    ) -> ReplResult<PeerReqHandle> {
        req.pending_bios = 1;
        let mut inner = device.lock();
        if inner.peer_reqs.len() >= self.net_conf.max_buffers as usize {
            return Err(ReplError::ResourceExhausted { what: "peer request" });
        }
        inner
            .peer_reqs
            .try_insert(req)
            .map_err(|_| ReplError::ResourceExhausted { what: "peer request" })
    }

    /// Hand a parked peer request's I/O to the backing device.
    pub(crate) fn submit_peer_io(&self, device: &Device, handle: PeerReqHandle) -> ReplResult<()> {
        let io = {
            let inner = device.lock();
            let req = inner.peer_reqs.get(handle).ok_or(ReplError::StaleHandle)?;
            BlockIoRequest {
                token: IoToken::Peer {
                    vnr: device.vnr,
                    req: handle,
                },
                dir: req.dir,
                sector: req.sector,
                size: req.size,
                data: if req.dir == IoDir::Write {
                    req.pages.clone()
                } else {
                    None
                },
            }
        };
        device.block_io.submit(io)
    }

    /// Park and submit a peer request. A refused submission completes it
    /// with an I/O error so the usual reply path answers the peer.
    pub(crate) fn submit_peer_request(&self, device: &Device, req: PeerRequest) -> ReplResult<()> {
        let handle = self.insert_peer_request(device, req)?;
        if let Err(e) = self.submit_peer_io(device, handle) {
            warn!("minor {}: peer request submit failed: {}", device.minor, e);
            self.peer_request_endio(device, handle, Err(std::io::Error::other(e.to_string())))?;
        }
        Ok(())
    }

    /// Give up on every pending local I/O of volume `vnr` (hung backing
    /// device). Applications see an error now; the late completions are
    /// still expected.
    pub fn abort_local_io(&self, vnr: u32) -> ReplResult<usize> {
        let device = self.device(vnr)?;
        let mut inner = device.lock();
        let pending: Vec<ReqHandle> = inner
            .requests
            .iter()
            .filter(|(_, r)| r.has(RQ_LOCAL_PENDING))
            .map(|(h, _)| h)
            .collect();
        for handle in &pending {
            if let Some(req) = inner.requests.get_mut(*handle) {
                req.apply(ReqEvent::AbortDiskIo);
            }
            self.req_settle(&device, &mut inner, *handle);
        }
        warn!("minor {}: aborted {} local requests", device.minor, pending.len());
        Ok(pending.len())
    }

    /// Resubmit local I/O of requests that completed with an error.
    pub fn restart_frozen_disk_io(&self, vnr: u32) -> ReplResult<usize> {
        let device = self.device(vnr)?;
        let restart: Vec<ReqHandle> = {
            let mut inner = device.lock();
            let frozen: Vec<ReqHandle> = inner
                .requests
                .iter()
                .filter(|(_, r)| r.has(RQ_LOCAL_COMPLETED) && !r.has(RQ_LOCAL_OK))
                .map(|(h, _)| h)
                .collect();
            for handle in &frozen {
                if let Some(req) = inner.requests.get_mut(*handle) {
                    req.apply(ReqEvent::RestartFrozenDiskIo);
                }
            }
            frozen
        };
        for handle in &restart {
            self.work.push_front(WorkItem::RestartDiskIo { vnr, req: *handle });
        }
        Ok(restart.len())
    }

    /// Apply `event` to a local request and complete or drop it as due.
    pub(crate) fn req_mod(&self, device: &Device, handle: ReqHandle, event: ReqEvent) -> ReplResult<()> {
        let mut inner = device.lock();
        match inner.requests.get_mut(handle) {
            Some(req) => req.apply(event),
            None => return Err(ReplError::StaleHandle),
        }
        self.req_settle(device, &mut inner, handle);
        Ok(())
    }

    /// Complete the application I/O once both sides are settled, and drop
    /// the request once nothing refers to it any more.
    pub(crate) fn req_settle(&self, device: &Device, inner: &mut DeviceInner, handle: ReqHandle) {
        let Some(req) = inner.requests.get_mut(handle) else {
            return;
        };
        if req.master_ready() {
            let result = req
                .master_result()
                .ok_or(ReplError::DiskFailure { minor: device.minor });
            req.complete_master(result);
        }
        if !req.can_destroy() {
            return;
        }
        if let Some(req) = inner.requests.remove(handle) {
            if req.is_write() {
                if req.has(RQ_LOCAL_COMPLETED) {
                    device.al_complete_io(inner, req.sector);
                }
                if !req.has(RQ_NET_OK | RQ_LOCAL_OK) {
                    device.set_out_of_sync(req.sector, req.size);
                }
            }
        }
    }

    // ---- work and timers ----

    /// Fire due resync timers: queue resync work for every armed device
    /// that has none queued.
    pub fn timer_tick(&self) {
        for device in self.devices() {
            if device.take_resync_timer() && !device.resync_work_queued.swap(true, Ordering::AcqRel) {
                self.work.push(WorkItem::ResyncTimer { vnr: device.vnr });
            }
        }
    }

    /// Queue resync work for `device` now.
    pub(crate) fn queue_resync_work(&self, device: &Device) {
        if !device.resync_work_queued.swap(true, Ordering::AcqRel) {
            self.work.push(WorkItem::ResyncTimer { vnr: device.vnr });
        }
    }

    /// Wait until everything queued so far has been executed.
    pub async fn flush_work(&self) -> ReplResult<()> {
        let (tx, rx) = oneshot::channel();
        self.work.push(WorkItem::Flush(tx));
        rx.await.map_err(|_| ReplError::Shutdown)
    }

    /// Still running (not stopped).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask all tasks to exit. The sender drains its queue in cancel mode.
    pub fn stop(&self) {
        info!("conn: stopping worker");
        self.running.store(false, Ordering::Release);
        self.work.wake();
        self.asender_wake.notify_one();
    }

    /// Start the sender, ack and timer tasks.
    pub fn spawn(self: &Arc<Self>) -> ConnectionTasks {
        let sender = tokio::spawn(self.clone().run_sender());
        let conn = self.clone();
        let asender = tokio::spawn(async move {
            while conn.is_running() {
                let notified = conn.asender_wake.notified();
                if let Err(e) = conn.process_done_ee() {
                    conn.request_network_failure(&e);
                }
                notified.await;
            }
        });
        let conn = self.clone();
        let timer = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SLEEP_TIME);
            while conn.is_running() {
                interval.tick().await;
                conn.timer_tick();
            }
        });
        ConnectionTasks {
            sender,
            asender,
            timer,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("cstate", &self.cstate())
            .field("volumes", &self.devices.read().len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bitmap::Bitmap;
    use crate::bitmap::InMemoryBitmap;
    use crate::block_io::MemoryBlockDevice;
    use crate::config::DiskConf;
    use crate::device::DeviceParts;
    use crate::hook::RecordingHook;
    use crate::metadata::MemoryMetadataStore;
    use crate::transport::LoopbackTransport;

    /// One connected node with a single volume and in-memory collaborators.
    pub(crate) struct TestNode {
        pub conn: Arc<Connection>,
        pub transport: Arc<LoopbackTransport>,
        pub disk: Arc<MemoryBlockDevice>,
        pub bitmap: Arc<InMemoryBitmap>,
        pub hook: Arc<RecordingHook>,
        pub metadata: Arc<MemoryMetadataStore>,
        pub device: Arc<Device>,
    }

    impl TestNode {
        /// Complete all queued block I/O.
        pub fn complete_io(&self) -> Vec<ReplResult<()>> {
            self.disk
                .complete_all()
                .into_iter()
                .map(|c| self.conn.io_complete(c))
                .collect()
        }
    }

    pub(crate) fn test_node(bits: u64, disk_conf: DiskConf, net: NetConf) -> TestNode {
        let transport = Arc::new(LoopbackTransport::new(1 << 26));
        let conn = Connection::new(transport.clone(), net, Arc::new(ResyncGraph::new())).unwrap();
        let capacity = bits * 8;
        let disk = Arc::new(MemoryBlockDevice::new(capacity));
        let bitmap = Arc::new(InMemoryBitmap::new(bits));
        let hook = Arc::new(RecordingHook::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let parts = DeviceParts {
            bitmap: bitmap.clone(),
            block_io: disk.clone(),
            hook: hook.clone(),
            metadata: metadata.clone(),
        };
        let device = conn
            .add_device(Device::new(0, 0, capacity, disk_conf, parts))
            .unwrap();
        device.update_state(|s| {
            s.disk = DiskState::UpToDate;
            s.pdsk = DiskState::UpToDate;
        });
        conn.connect();
        TestNode {
            conn,
            transport,
            disk,
            bitmap,
            hook,
            metadata,
            device,
        }
    }

    fn block(byte: u8) -> Bytes {
        Bytes::from(vec![byte; 4096])
    }

    #[test]
    fn test_unknown_digest_rejected() {
        let transport = Arc::new(LoopbackTransport::new(1024));
        let net = NetConf {
            csums_alg: Some("md4".into()),
            ..Default::default()
        };
        let err = Connection::new(transport, net, Arc::new(ResyncGraph::new())).unwrap_err();
        assert!(matches!(err, ReplError::UnknownDigest { .. }));
    }

    #[test]
    fn test_unknown_volume() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        assert!(matches!(n.conn.device(9), Err(ReplError::UnknownDevice { vnr: 9 })));
    }

    #[test]
    fn test_epoch_closes_only_with_writes() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.conn.start_new_epoch();
        assert_eq!(n.conn.current_tle_nr(), 1);
        let _rx = n.conn.submit_write(0, 0, block(1)).unwrap();
        n.conn.start_new_epoch();
        assert_eq!(n.conn.current_tle_nr(), 2);
    }

    #[tokio::test]
    async fn test_write_without_peer_marks_out_of_sync() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.device.update_state(|s| s.pdsk = DiskState::DUnknown);
        let rx = n.conn.submit_write(0, 16, block(5)).unwrap();
        assert!(n.conn.work.is_empty());
        n.complete_io();
        assert!(rx.await.unwrap().is_ok());
        assert!(n.bitmap.test_bit(2));
        assert_eq!(n.disk.read_at(16, 1)[0], 5);
    }

    #[tokio::test]
    async fn test_ahead_sends_out_of_sync_notice() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.device.update_state(|s| s.conn = ConnState::Ahead);
        let rx = n.conn.submit_write(0, 8, block(5)).unwrap();
        assert!(n.bitmap.test_bit(1));
        n.conn.run_pending().await.unwrap();
        assert_eq!(
            n.transport.take_sent(),
            vec![crate::transport::Packet::OutOfSync {
                vnr: 0,
                sector: 8,
                size: 4096
            }]
        );
        n.complete_io();
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(n.conn.current_tle_nr(), 1);
    }

    #[tokio::test]
    async fn test_read_served_locally_when_up_to_date() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.disk.write_at(0, &[9u8; 4096]);
        let rx = n.conn.submit_read(0, 0, 4096).unwrap();
        assert!(n.conn.work.is_empty());
        n.complete_io();
        assert_eq!(rx.await.unwrap().unwrap()[0], 9);
    }

    #[tokio::test]
    async fn test_inconsistent_read_goes_to_peer_for_dirty_block() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.device.update_state(|s| s.disk = DiskState::Inconsistent);
        n.bitmap.set_bits(1, 1);
        // clean block: local
        let _clean = n.conn.submit_read(0, 0, 4096).unwrap();
        assert_eq!(n.disk.queued(), 1);
        // dirty block: remote
        let _dirty = n.conn.submit_read(0, 8, 4096).unwrap();
        assert_eq!(n.conn.work.len(), 1);
    }

    #[test]
    fn test_no_disk_and_no_peer_fails() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.device.update_state(|s| {
            s.disk = DiskState::Diskless;
            s.pdsk = DiskState::DUnknown;
        });
        assert!(matches!(
            n.conn.submit_write(0, 0, block(1)),
            Err(ReplError::DiskFailure { .. })
        ));
        assert!(n.conn.submit_read(0, 0, 4096).is_err());
    }

    #[tokio::test]
    async fn test_abort_completes_application_with_error() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.device.update_state(|s| s.pdsk = DiskState::DUnknown);
        let rx = n.conn.submit_read(0, 0, 4096).unwrap();
        assert_eq!(n.conn.abort_local_io(0).unwrap(), 1);
        assert!(rx.await.unwrap().is_err());
        // late completion of the aborted read with success is fatal
        let results = n.complete_io();
        assert!(results[0].as_ref().unwrap_err().is_fatal());
        assert!(n.device.is_fatal());
        assert!(n.conn.submit_read(0, 0, 4096).unwrap_err().is_fatal());
    }

    #[test]
    fn test_timer_tick_queues_once() {
        let n = test_node(16, DiskConf::default(), NetConf::default());
        n.device.arm_resync_timer();
        n.conn.timer_tick();
        n.device.arm_resync_timer();
        n.conn.timer_tick();
        assert_eq!(n.conn.work.len(), 1);
    }
}
