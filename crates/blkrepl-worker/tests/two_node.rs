//! End-to-end resync and verify runs between two in-memory nodes.

use std::sync::Arc;

use blkrepl_worker::{
    Bitmap, ConnState, Device, DeviceParts, DiskConf, DiskState, HelperEvent, InMemoryBitmap,
    IoErrorPolicy, MemoryBlockDevice, MemoryMetadataStore, RecordingHook, ReplError, ResyncGraph, SimPair,
    WorkerConfig,
};

const MIB_SECTORS: u64 = 2048;

fn fixed_rate(rate_kib: u32) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.disk.c_plan_ahead = 0;
    config.disk.resync_rate_kib = rate_kib;
    config
}

#[tokio::test]
async fn test_full_resync_at_fixed_rate() {
    // 10 MiB/s at 10 ticks/s is 1 MiB per tick
    let config = fixed_rate(10240);
    let pair = SimPair::new(64 * MIB_SECTORS, &config).unwrap();
    let marked = pair.dirty(100, 1);
    assert_eq!(marked, 16384);

    let report = pair.run_resync(200).await.unwrap();
    assert!(report.ticks <= 64, "took {} ticks", report.ticks);
    assert_eq!(report.divergent_blocks, 0);
    assert_eq!(report.target.disk, DiskState::UpToDate);
    assert_eq!(report.source.pdsk, DiskState::UpToDate);
    assert_eq!(report.target.rs_pending, 0);
    assert_eq!(report.source.unacked, 0);
    assert_eq!(report.target.sync_rate_kib, 10240);
    assert_eq!(pair.target.device.uuids().current, pair.source.device.uuids().current);
}

#[tokio::test]
async fn test_resync_with_dynamic_controller() {
    let config = WorkerConfig::default();
    let pair = SimPair::new(4 * MIB_SECTORS, &config).unwrap();
    pair.dirty(50, 3);
    let report = pair.run_resync(2_000).await.unwrap();
    assert_eq!(report.divergent_blocks, 0);
    assert_eq!(pair.target.bitmap.total_weight(), 0);
    assert_eq!(report.target.conn, ConnState::Connected);
}

#[tokio::test]
async fn test_checksum_resync_skips_equal_blocks() {
    let mut config = fixed_rate(10240);
    config.net.csums_alg = Some("sha256".into());
    let pair = SimPair::new(MIB_SECTORS, &config).unwrap();
    // isolated blocks keep every request one block long
    for bit in (0..64).step_by(2) {
        pair.mark_out_of_sync(bit, bit % 4 == 0);
    }
    assert_eq!(pair.divergent_blocks(), 16);

    let report = pair.run_resync(50).await.unwrap();
    assert_eq!(report.divergent_blocks, 0);
    assert_eq!(report.target.rs_same_csum, 16);
    assert_eq!(report.source.rs_same_csum, 16);
    assert_eq!(pair.target.bitmap.total_weight(), 0);
}

#[tokio::test]
async fn test_verify_finds_mismatch_and_resync_repairs_it() {
    let mut config = fixed_rate(10240);
    config.net.verify_alg = Some("blake3".into());
    let pair = SimPair::new(MIB_SECTORS, &config).unwrap();
    for bit in [3, 4, 200] {
        pair.corrupt_target(bit);
    }

    let report = pair.run_verify(100).await.unwrap();
    assert_eq!(report.source.ov_out_of_sync, 3);
    assert_eq!(report.target.ov_out_of_sync, 3);
    assert_eq!(pair.source.hook.count(HelperEvent::OutOfSync), 1);
    assert!(pair.source.bitmap.test_bit(4));
    assert!(pair.target.bitmap.test_bit(200));
    assert_eq!(report.divergent_blocks, 3);

    let report = pair.run_resync(100).await.unwrap();
    assert_eq!(report.divergent_blocks, 0);
}

#[tokio::test]
async fn test_verify_of_identical_disks_is_clean() {
    let mut config = fixed_rate(10240);
    config.net.verify_alg = Some("sha256".into());
    let pair = SimPair::new(MIB_SECTORS, &config).unwrap();
    let report = pair.run_verify(100).await.unwrap();
    assert_eq!(report.source.ov_out_of_sync, 0);
    assert_eq!(pair.source.hook.count(HelperEvent::OutOfSync), 0);
    assert_eq!(pair.source.bitmap.total_weight(), 0);
}

#[tokio::test]
async fn test_verify_with_stop_sector_finishes_both_sides() {
    let mut config = fixed_rate(10240);
    config.net.verify_alg = Some("sha256".into());
    let pair = SimPair::new(MIB_SECTORS, &config).unwrap();
    // one difference inside the range, one past its end
    pair.corrupt_target(2);
    pair.corrupt_target(100);

    let report = pair.run_verify_range(0, Some(64), 50).await.unwrap();
    assert_eq!(report.source.conn, ConnState::Connected);
    assert_eq!(report.target.conn, ConnState::Connected);
    assert_eq!(report.source.ov_out_of_sync, 1);
    assert_eq!(report.target.ov_out_of_sync, 1);
    assert!(pair.source.bitmap.test_bit(2));
    assert!(!pair.source.bitmap.test_bit(100));

    // the target is free for the next run
    let report = pair.run_verify(100).await.unwrap();
    assert_eq!(report.source.ov_out_of_sync, 2);
}

#[tokio::test]
async fn test_finished_resync_stays_finished() {
    let pair = SimPair::new(MIB_SECTORS, &fixed_rate(10240)).unwrap();
    pair.dirty(20, 9);
    pair.run_resync(50).await.unwrap();
    let syncs = pair.target.metadata.sync_count();
    for _ in 0..5 {
        pair.tick().await.unwrap();
    }
    assert_eq!(pair.target.hook.count(HelperEvent::AfterResyncTarget), 1);
    assert_eq!(pair.target.metadata.sync_count(), syncs);
    assert_eq!(pair.target.device.state().conn, ConnState::Connected);
}

#[tokio::test]
async fn test_media_error_leaves_target_inconsistent() {
    let mut config = fixed_rate(10240);
    config.disk.on_io_error = IoErrorPolicy::PassOn;
    let pair = SimPair::new(MIB_SECTORS, &config).unwrap();
    // one coalesced request; its read fails on the source
    for bit in 0..8 {
        pair.mark_out_of_sync(bit, true);
    }
    pair.source.disk.fail_sector(16);

    let report = pair.run_resync(50).await.unwrap();
    assert_eq!(report.target.disk, DiskState::Inconsistent);
    assert_eq!(report.target.pdsk, DiskState::UpToDate);
    assert_eq!(report.source.pdsk, DiskState::Inconsistent);
    assert_eq!(pair.target.bitmap.total_weight(), 8);
    assert_eq!(report.divergent_blocks, 8);
    assert_eq!(report.target.rs_pending, 0);
}

fn graph_device(minor: u32, after: Option<u32>) -> Arc<Device> {
    let conf = DiskConf {
        resync_after: after,
        ..Default::default()
    };
    let parts = DeviceParts {
        bitmap: Arc::new(InMemoryBitmap::new(64)),
        block_io: Arc::new(MemoryBlockDevice::new(512)),
        hook: Arc::new(RecordingHook::new()),
        metadata: Arc::new(MemoryMetadataStore::new()),
    };
    let device = Arc::new(Device::new(minor, minor, 512, conf, parts));
    device.update_state(|s| {
        s.conn = ConnState::Connected;
        s.disk = DiskState::UpToDate;
        s.pdsk = DiskState::UpToDate;
    });
    device
}

#[test]
fn test_resync_after_cycle_rejected() {
    let graph = ResyncGraph::new();
    graph.register(graph_device(10, None)).unwrap();
    graph.register(graph_device(11, Some(10))).unwrap();
    graph.register(graph_device(12, Some(11))).unwrap();

    let err = graph.set_resync_after(10, Some(12)).unwrap_err();
    assert!(matches!(err, ReplError::ResyncAfterCycle { minor: 10, after: 12 }));
    // the rejected change left the chain usable
    graph.set_resync_after(12, None).unwrap();
    graph.set_resync_after(10, Some(12)).unwrap();
}
