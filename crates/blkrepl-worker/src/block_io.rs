//! Block I/O collaborator: submission to the local backing device.
//!
//! Completions are not delivered through callbacks. A submitted
//! [`BlockIoRequest`] carries an [`IoToken`]; whoever drives the backing
//! device hands the matching [`IoCompletion`] to
//! [`Connection::io_complete`](crate::connection::Connection::io_complete),
//! which routes it to the local-request or peer-request completion path.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::bitmap::{Sector, SECTOR_SHIFT};
use crate::error::{ReplError, ReplResult};
use crate::peer_request::PeerReqHandle;
use crate::request::ReqHandle;

/// Direction of a block I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    /// Read.
    Read,
    /// Speculative read; failures are not disk errors.
    ReadAhead,
    /// Write.
    Write,
}

/// Identifies the request a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoToken {
    /// Local application request.
    Local {
        /// Volume number.
        vnr: u32,
        /// Request handle.
        req: ReqHandle,
    },
    /// I/O performed on behalf of the peer.
    Peer {
        /// Volume number.
        vnr: u32,
        /// Peer request handle.
        req: PeerReqHandle,
    },
}

/// One I/O submitted to the backing device.
#[derive(Debug, Clone)]
pub struct BlockIoRequest {
    /// Completion routing token.
    pub token: IoToken,
    /// Direction.
    pub dir: IoDir,
    /// Start sector.
    pub sector: Sector,
    /// Length in bytes.
    pub size: u32,
    /// Payload for writes.
    pub data: Option<Bytes>,
}

/// Result of one I/O.
#[derive(Debug)]
pub struct IoCompletion {
    /// Completion routing token.
    pub token: IoToken,
    /// Read payload (empty for writes) or the device error.
    pub result: std::io::Result<Bytes>,
}

/// Submission side of the local backing device.
pub trait BlockIo: Send + Sync {
    /// Submit an I/O. Errors mean the I/O was not queued at all.
    fn submit(&self, io: BlockIoRequest) -> ReplResult<()>;

    /// Backpressure signal: background resync should back off.
    fn congested(&self) -> bool {
        false
    }
}

/// In-memory backing device. Submitted I/O stays queued until
/// [`MemoryBlockDevice::complete_all`] runs it.
pub struct MemoryBlockDevice {
    capacity: Sector,
    data: Mutex<Vec<u8>>,
    queue: Mutex<VecDeque<BlockIoRequest>>,
    bad_sectors: Mutex<HashSet<Sector>>,
    congested: AtomicBool,
    refuse_submit: AtomicBool,
}

impl MemoryBlockDevice {
    /// Create a zero-filled device of `capacity` sectors.
    pub fn new(capacity: Sector) -> Self {
        Self {
            capacity,
            data: Mutex::new(vec![0u8; (capacity << SECTOR_SHIFT) as usize]),
            queue: Mutex::new(VecDeque::new()),
            bad_sectors: Mutex::new(HashSet::new()),
            congested: AtomicBool::new(false),
            refuse_submit: AtomicBool::new(false),
        }
    }

    /// Device size in sectors.
    pub fn capacity(&self) -> Sector {
        self.capacity
    }

    /// Write directly, bypassing the queue.
    pub fn write_at(&self, sector: Sector, bytes: &[u8]) {
        let start = (sector << SECTOR_SHIFT) as usize;
        let mut data = self.data.lock();
        let end = (start + bytes.len()).min(data.len());
        data[start..end].copy_from_slice(&bytes[..end - start]);
    }

    /// Read directly, bypassing the queue.
    pub fn read_at(&self, sector: Sector, size: u32) -> Bytes {
        let start = (sector << SECTOR_SHIFT) as usize;
        let data = self.data.lock();
        let end = (start + size as usize).min(data.len());
        Bytes::copy_from_slice(&data[start..end])
    }

    /// Make every I/O touching `sector` fail.
    pub fn fail_sector(&self, sector: Sector) {
        self.bad_sectors.lock().insert(sector);
    }

    /// Raise or clear the backpressure signal.
    pub fn set_congested(&self, congested: bool) {
        self.congested.store(congested, Ordering::Release);
    }

    /// Make [`BlockIo::submit`] refuse new I/O.
    pub fn refuse_submissions(&self, refuse: bool) {
        self.refuse_submit.store(refuse, Ordering::Release);
    }

    /// Number of queued, not yet completed I/Os.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every queued I/O in order and return their completions.
    pub fn complete_all(&self) -> Vec<IoCompletion> {
        let ios: Vec<_> = self.queue.lock().drain(..).collect();
        ios.into_iter().map(|io| self.execute(io)).collect()
    }

    fn touches_bad_sector(&self, sector: Sector, size: u32) -> bool {
        let end = sector + (size as u64 >> SECTOR_SHIFT);
        self.bad_sectors
            .lock()
            .iter()
            .any(|bad| *bad >= sector && *bad < end)
    }

    fn execute(&self, io: BlockIoRequest) -> IoCompletion {
        if self.touches_bad_sector(io.sector, io.size) || io.sector >= self.capacity {
            debug!("Mock I/O error: sector={}, size={}", io.sector, io.size);
            return IoCompletion {
                token: io.token,
                result: Err(std::io::Error::other("media error")),
            };
        }
        let result = match io.dir {
            IoDir::Read | IoDir::ReadAhead => Ok(self.read_at(io.sector, io.size)),
            IoDir::Write => {
                if let Some(payload) = &io.data {
                    self.write_at(io.sector, payload);
                }
                Ok(Bytes::new())
            }
        };
        IoCompletion {
            token: io.token,
            result,
        }
    }
}

impl BlockIo for MemoryBlockDevice {
    fn submit(&self, io: BlockIoRequest) -> ReplResult<()> {
        if self.refuse_submit.load(Ordering::Acquire) {
            return Err(ReplError::ResourceExhausted {
                what: "block I/O submission",
            });
        }
        debug!(
            "Mock submit: {:?} sector={}, size={}",
            io.dir, io.sector, io.size
        );
        self.queue.lock().push_back(io);
        Ok(())
    }

    fn congested(&self) -> bool {
        self.congested.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Handle;

    fn token() -> IoToken {
        IoToken::Peer {
            vnr: 0,
            req: Handle::from_raw(1),
        }
    }

    #[test]
    fn test_write_then_read() {
        let dev = MemoryBlockDevice::new(64);
        dev.submit(BlockIoRequest {
            token: token(),
            dir: IoDir::Write,
            sector: 8,
            size: 4096,
            data: Some(Bytes::from(vec![7u8; 4096])),
        })
        .unwrap();
        assert_eq!(dev.queued(), 1);
        assert_eq!(dev.read_at(8, 4)[..], [0, 0, 0, 0]);
        let done = dev.complete_all();
        assert!(done[0].result.is_ok());
        assert_eq!(dev.read_at(8, 4)[..], [7, 7, 7, 7]);
    }

    #[test]
    fn test_bad_sector_fails() {
        let dev = MemoryBlockDevice::new(64);
        dev.fail_sector(10);
        dev.submit(BlockIoRequest {
            token: token(),
            dir: IoDir::Read,
            sector: 8,
            size: 4096,
            data: None,
        })
        .unwrap();
        let done = dev.complete_all();
        assert!(done[0].result.is_err());
    }

    #[test]
    fn test_refuse_and_congestion() {
        let dev = MemoryBlockDevice::new(8);
        assert!(!dev.congested());
        dev.set_congested(true);
        assert!(dev.congested());
        dev.refuse_submissions(true);
        let err = dev
            .submit(BlockIoRequest {
                token: token(),
                dir: IoDir::Read,
                sector: 0,
                size: 512,
                data: None,
            })
            .unwrap_err();
        assert!(err.is_transient());
    }
}
