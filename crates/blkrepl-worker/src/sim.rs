//! Two-node in-memory harness.
//!
//! A [`SimPair`] wires two connections back to back over loopback
//! transports and drives both by hand: packets are shuttled between the
//! outboxes, queued block I/O is completed, and each side's work queue is
//! drained until nothing moves. [`SimPair::tick`] stands in for one
//! resync timer period.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bitmap::{Bitmap, InMemoryBitmap, Sector, BM_BLOCK_SIZE, BM_SECT_PER_BIT};
use crate::block_io::MemoryBlockDevice;
use crate::config::WorkerConfig;
use crate::connection::Connection;
use crate::deps::ResyncGraph;
use crate::device::{Device, DeviceParts, ResyncStats};
use crate::error::{ReplError, ReplResult};
use crate::finish::ResyncSide;
use crate::hook::RecordingHook;
use crate::metadata::{MemoryMetadataStore, UuidSet};
use crate::state::{ConnState, DiskState};
use crate::transport::LoopbackTransport;

/// Rounds of packet exchange allowed before a step is declared stuck.
const MAX_ROUNDS: usize = 100_000;

/// One side of the pair with handles on its in-memory collaborators.
pub struct SimNode {
    /// The connection to the other node.
    pub conn: Arc<Connection>,
    /// Outbox towards the other node.
    pub transport: Arc<LoopbackTransport>,
    /// Backing device.
    pub disk: Arc<MemoryBlockDevice>,
    /// Out-of-sync bitmap.
    pub bitmap: Arc<InMemoryBitmap>,
    /// Recorded handler invocations.
    pub hook: Arc<RecordingHook>,
    /// Metadata writes.
    pub metadata: Arc<MemoryMetadataStore>,
    /// Volume 0.
    pub device: Arc<Device>,
}

impl SimNode {
    fn new(capacity_sectors: u64, config: &WorkerConfig, current_uuid: u64) -> ReplResult<Self> {
        let transport = Arc::new(LoopbackTransport::new(1 << 28));
        let conn = Connection::new(
            transport.clone(),
            config.net.clone(),
            Arc::new(ResyncGraph::new()),
        )?;
        let disk = Arc::new(MemoryBlockDevice::new(capacity_sectors));
        let bitmap = Arc::new(InMemoryBitmap::for_capacity(capacity_sectors));
        let hook = Arc::new(RecordingHook::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let parts = DeviceParts {
            bitmap: bitmap.clone(),
            block_io: disk.clone(),
            hook: hook.clone(),
            metadata: metadata.clone(),
        };
        let device = conn.add_device(Device::new(
            0,
            0,
            capacity_sectors,
            config.disk.clone(),
            parts,
        ))?;
        device.update_state(|s| {
            s.disk = DiskState::UpToDate;
            s.pdsk = DiskState::UpToDate;
        });
        device.set_uuids(UuidSet {
            current: current_uuid,
            ..Default::default()
        });
        conn.connect();
        Ok(Self {
            conn,
            transport,
            disk,
            bitmap,
            hook,
            metadata,
            device,
        })
    }

    /// Feed every completed block I/O back into the connection.
    fn complete_io(&self) -> usize {
        let completions = self.disk.complete_all();
        let n = completions.len();
        for c in completions {
            if let Err(e) = self.conn.io_complete(c) {
                debug!("sim: completion rejected: {}", e);
            }
        }
        n
    }
}

/// Outcome of a simulated run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Timer ticks it took both sides to return to Connected.
    pub ticks: u32,
    /// Blocks whose contents still differ between the two disks.
    pub divergent_blocks: u64,
    /// Source side counters.
    pub source: ResyncStats,
    /// Target side counters.
    pub target: ResyncStats,
}

/// Two connected nodes with one volume each.
pub struct SimPair {
    /// The node holding good data.
    pub source: SimNode,
    /// The node being brought up to date.
    pub target: SimNode,
}

impl SimPair {
    /// Two UpToDate nodes of `capacity_sectors` that know each other's
    /// generation identifiers.
    pub fn new(capacity_sectors: u64, config: &WorkerConfig) -> ReplResult<Self> {
        let source = SimNode::new(capacity_sectors, config, 0x5eed_0001)?;
        let target = SimNode::new(capacity_sectors, config, 0x5eed_0002)?;
        source.device.set_peer_uuids(target.device.uuids());
        target.device.set_peer_uuids(source.device.uuids());
        Ok(Self { source, target })
    }

    /// Mark `bit` out of sync on both sides. With `differ` the source
    /// block gets new contents the target does not have.
    pub fn mark_out_of_sync(&self, bit: u64, differ: bool) {
        self.source.bitmap.set_bits(bit, bit);
        self.target.bitmap.set_bits(bit, bit);
        if differ {
            self.source
                .disk
                .write_at(bit * BM_SECT_PER_BIT, &block_pattern(bit));
        }
    }

    /// Mark roughly `percent` of all blocks out of sync with differing
    /// contents. Returns how many blocks were marked.
    pub fn dirty(&self, percent: u32, seed: u64) -> u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut marked = 0;
        for bit in 0..self.source.bitmap.bits() {
            if rng.gen_range(0..100) < percent {
                self.mark_out_of_sync(bit, true);
                marked += 1;
            }
        }
        info!("sim: marked {} blocks out of sync", marked);
        marked
    }

    /// Change a target block behind the bitmap's back, so only verify can
    /// find it.
    pub fn corrupt_target(&self, bit: u64) {
        let mut data = block_pattern(bit).to_vec();
        data[0] ^= 0xff;
        self.target.disk.write_at(bit * BM_SECT_PER_BIT, &data);
    }

    /// Number of blocks whose contents differ between the two disks.
    pub fn divergent_blocks(&self) -> u64 {
        (0..self.source.bitmap.bits())
            .filter(|bit| {
                let sector = bit * BM_SECT_PER_BIT;
                self.source.disk.read_at(sector, BM_BLOCK_SIZE)
                    != self.target.disk.read_at(sector, BM_BLOCK_SIZE)
            })
            .count() as u64
    }

    /// Exchange packets, complete I/O and run queued work on both sides
    /// until nothing moves.
    pub async fn step(&self) -> ReplResult<()> {
        for _ in 0..MAX_ROUNDS {
            let mut moved = 0;
            moved += deliver(&self.source, &self.target);
            moved += deliver(&self.target, &self.source);
            moved += self.source.complete_io();
            moved += self.target.complete_io();
            moved += self.source.conn.run_pending().await?;
            moved += self.target.conn.run_pending().await?;
            if moved == 0 {
                return Ok(());
            }
        }
        Err(ReplError::ResourceExhausted {
            what: "simulation rounds",
        })
    }

    /// One timer period on both sides.
    pub async fn tick(&self) -> ReplResult<()> {
        self.source.conn.timer_tick();
        self.target.conn.timer_tick();
        self.step().await
    }

    /// Resync the marked blocks. Returns after both sides are back in
    /// Connected, or with an error after `max_ticks`.
    pub async fn run_resync(&self, max_ticks: u32) -> ReplResult<SimReport> {
        self.source.conn.start_resync(0, ResyncSide::Source)?;
        self.target.conn.start_resync(0, ResyncSide::Target)?;
        self.run_until_connected(max_ticks).await
    }

    /// Verify the whole device from the source side.
    pub async fn run_verify(&self, max_ticks: u32) -> ReplResult<SimReport> {
        self.run_verify_range(0, None, max_ticks).await
    }

    /// Verify from `start` up to `stop` (end of device if None).
    pub async fn run_verify_range(
        &self,
        start: Sector,
        stop: Option<Sector>,
        max_ticks: u32,
    ) -> ReplResult<SimReport> {
        self.source.conn.start_online_verify(0, start, stop)?;
        self.target.conn.accept_online_verify(0)?;
        self.run_until_connected(max_ticks).await
    }

    async fn run_until_connected(&self, max_ticks: u32) -> ReplResult<SimReport> {
        self.step().await?;
        let mut ticks = 0;
        while !self.both_connected() {
            if ticks >= max_ticks {
                warn!(
                    "sim: gave up after {} ticks (source {}, target {})",
                    ticks,
                    self.source.device.state().conn,
                    self.target.device.state().conn
                );
                return Err(ReplError::StateRefused {
                    minor: self.source.device.minor,
                    reason: "run did not finish in time",
                });
            }
            self.tick().await?;
            ticks += 1;
        }
        info!("sim: run finished after {} ticks", ticks);
        Ok(self.report(ticks))
    }

    fn both_connected(&self) -> bool {
        self.source.device.state().conn == ConnState::Connected
            && self.target.device.state().conn == ConnState::Connected
    }

    /// Current counters of both sides.
    pub fn report(&self, ticks: u32) -> SimReport {
        SimReport {
            ticks,
            divergent_blocks: self.divergent_blocks(),
            source: self.source.device.stats(),
            target: self.target.device.stats(),
        }
    }
}

fn deliver(from: &SimNode, to: &SimNode) -> usize {
    let packets = from.transport.take_sent();
    let n = packets.len();
    for packet in packets {
        let name = packet.name();
        if let Err(e) = to.conn.receive(packet) {
            warn!("sim: {} rejected: {}", name, e);
            to.conn.request_network_failure(&e);
        }
    }
    n
}

fn block_pattern(bit: u64) -> Bytes {
    let byte = (bit % 251) as u8 + 1;
    let mut data = vec![byte; BM_BLOCK_SIZE as usize];
    data[..8].copy_from_slice(&bit.to_le_bytes());
    Bytes::from(data)
}
