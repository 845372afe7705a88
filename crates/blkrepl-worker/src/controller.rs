//! Adaptive resync rate controller.
//!
//! Runs once per [`SLEEP_TIME`] tick. The controller keeps an estimate of the
//! sectors requested from the peer but not yet answered and a plan ring of
//! corrections for the coming ticks. Each tick it compares the desired
//! amount in flight with what is in flight plus what is already planned,
//! spreads the difference evenly over the ring, and releases the slot that
//! is due now on top of whatever arrived since the last tick.
//!
//! All quantities are in 512-byte sectors unless the name says otherwise.

use std::time::Duration;

use tracing::debug;

use crate::bitmap::{BM_BLOCK_SHIFT, SECTOR_SHIFT};
use crate::config::DiskConf;
use crate::fifo::FifoBuffer;

/// Resync tick period.
pub const SLEEP_TIME: Duration = Duration::from_millis(100);

/// Ticks per second.
pub const TICKS_PER_SEC: u64 = 1000 / SLEEP_TIME.as_millis() as u64;

const SECT_PER_KIB: u64 = 2;
const BLOCK_SECT_SHIFT: u32 = BM_BLOCK_SHIFT - SECTOR_SHIFT;
const BLOCK_KIB: u64 = 1 << (BM_BLOCK_SHIFT - 10);
const BM_BLOCK_SECTORS: i64 = 1 << BLOCK_SECT_SHIFT;

/// Sectors per tick for a rate in KiB/s.
pub fn kib_per_sec_to_sect_per_tick(rate_kib: u32) -> i64 {
    (rate_kib as u64 * SECT_PER_KIB / TICKS_PER_SEC) as i64
}

/// Rate controller state of one device.
#[derive(Debug, Clone)]
pub struct RateController {
    plan: FifoBuffer,
    in_flight: i64,
    c_sync_rate_kib: u64,
}

impl RateController {
    /// Controller with a plan ring of `steps` slots (0 = fixed-rate mode).
    pub fn new(steps: usize) -> Self {
        Self {
            plan: FifoBuffer::new(steps),
            in_flight: 0,
            c_sync_rate_kib: 0,
        }
    }

    /// Zero the in-flight estimate and the whole plan.
    pub fn reset(&mut self) {
        self.in_flight = 0;
        self.plan.set(0);
    }

    /// Replace the plan ring after a `c_plan_ahead` change. The new ring
    /// starts empty.
    pub fn resize(&mut self, steps: usize) {
        if steps != self.plan.len() {
            self.plan = FifoBuffer::new(steps);
        }
    }

    /// The plan ring.
    pub fn plan(&self) -> &FifoBuffer {
        &self.plan
    }

    /// Sectors requested from the peer and not yet answered.
    pub fn in_flight(&self) -> i64 {
        self.in_flight
    }

    /// Resync rate chosen on the last tick, in KiB/s.
    pub fn sync_rate_kib(&self) -> u64 {
        self.c_sync_rate_kib
    }

    /// Account for `sectors` newly requested from the peer.
    pub fn add_in_flight(&mut self, sectors: u64) {
        self.in_flight += sectors as i64;
    }

    /// One controller step: sectors to request this tick, given `sect_in`
    /// sectors answered since the last tick. `in_flight` must already have
    /// been reduced by `sect_in`.
    pub fn plan_sectors(&mut self, conf: &DiskConf, sect_in: u64) -> u64 {
        let steps = self.plan.len() as i64;
        if steps == 0 {
            return 0;
        }
        let sect_in = sect_in as i64;

        let want = if self.in_flight + sect_in == 0 {
            // nothing moving yet: plan the configured rate across the ring
            kib_per_sec_to_sect_per_tick(conf.resync_rate_kib) * steps
        } else if conf.c_fill_target > 0 {
            conf.c_fill_target as i64
        } else {
            sect_in * conf.c_delay_target as i64 * TICKS_PER_SEC as i64 / 10
        };

        let correction = want - self.in_flight - self.plan.total();
        let cps = correction / steps;
        self.plan.add_val(cps);
        let curr_corr = self.plan.push(0);
        debug_assert_eq!(self.plan.total(), self.plan.sum());

        let max_sect = kib_per_sec_to_sect_per_tick(conf.c_max_rate_kib);
        let req_sect = (sect_in + curr_corr).clamp(0, max_sect.max(0));

        debug!(
            "rs controller: sect_in={}, in_flight={}, want={}, correction={}, cps={}, curr_corr={}, req={}",
            sect_in, self.in_flight, want, correction, cps, curr_corr, req_sect
        );
        req_sect as u64
    }

    /// Number of 4 KiB resync requests to issue this tick.
    ///
    /// Uses the controller when the plan ring is non-empty and the fixed
    /// `resync_rate_kib` otherwise. The result never lets more than half of
    /// the peer's `max_buffers` be in flight; it is zero when that budget is
    /// already used up.
    pub fn number_requests(&mut self, conf: &DiskConf, max_buffers: u32, sect_in: u64) -> u64 {
        self.in_flight -= sect_in as i64;

        let number = if !self.plan.is_empty() {
            let number = (self.plan_sectors(conf, sect_in) >> BLOCK_SECT_SHIFT) as i64;
            self.c_sync_rate_kib = number as u64 * BLOCK_KIB * TICKS_PER_SEC;
            number
        } else {
            self.c_sync_rate_kib = conf.resync_rate_kib as u64;
            (conf.resync_rate_kib as u64 / (BLOCK_KIB * TICKS_PER_SEC)) as i64
        };

        let mxb = (max_buffers / 2) as i64;
        let room = mxb - self.in_flight / BM_BLOCK_SECTORS;
        number.min(room).max(0) as u64
    }
}
