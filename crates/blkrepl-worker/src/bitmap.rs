//! Out-of-sync bitmap collaborator and block geometry.
//!
//! One bit covers one 4 KiB block. The worker only needs the query and
//! update primitives in [`Bitmap`]; how bits are stored and persisted is up
//! to the implementation. [`InMemoryBitmap`] is a plain word vector.

use parking_lot::RwLock;

/// 512-byte sector number.
pub type Sector = u64;

/// log2 of the sector size.
pub const SECTOR_SHIFT: u32 = 9;
/// log2 of the bytes covered by one bitmap bit.
pub const BM_BLOCK_SHIFT: u32 = 12;
/// Bytes covered by one bitmap bit.
pub const BM_BLOCK_SIZE: u32 = 1 << BM_BLOCK_SHIFT;
/// Sectors covered by one bitmap bit.
pub const BM_SECT_PER_BIT: u64 = 1 << (BM_BLOCK_SHIFT - SECTOR_SHIFT);
/// log2 of the bytes covered by one resync extent.
pub const BM_EXT_SHIFT: u32 = 24;
/// Mask selecting the bit index within a resync extent.
pub const BM_BLOCKS_PER_BM_EXT_MASK: u64 = (1 << (BM_EXT_SHIFT - BM_BLOCK_SHIFT)) - 1;

/// First sector covered by `bit`.
pub fn bit_to_sect(bit: u64) -> Sector {
    bit << (BM_BLOCK_SHIFT - SECTOR_SHIFT)
}

/// Bit covering `sector`.
pub fn sect_to_bit(sector: Sector) -> u64 {
    sector >> (BM_BLOCK_SHIFT - SECTOR_SHIFT)
}

/// Resync extent containing `sector`.
pub fn sect_to_ext(sector: Sector) -> u64 {
    sector >> (BM_EXT_SHIFT - SECTOR_SHIFT)
}

/// KiB covered by `bits` bitmap bits.
pub fn bits_to_kib(bits: u64) -> u64 {
    bits << (BM_BLOCK_SHIFT - 10)
}

/// Bits that may be cleared after `size` bytes at `sector` became in sync.
/// Only blocks fully covered by the range qualify, except the (possibly
/// short) last block of the device.
pub fn in_sync_bit_range(sector: Sector, size: u32, capacity: Sector) -> Option<(u64, u64)> {
    if size == 0 || capacity == 0 {
        return None;
    }
    let mut esector = sector + (size as u64 >> SECTOR_SHIFT) - 1;
    if esector >= capacity {
        esector = capacity - 1;
    }
    if esector < BM_SECT_PER_BIT - 1 {
        return None;
    }
    let ebnr = if esector == capacity - 1 {
        sect_to_bit(capacity - 1)
    } else {
        sect_to_bit(esector - (BM_SECT_PER_BIT - 1))
    };
    let sbnr = sect_to_bit(sector + BM_SECT_PER_BIT - 1);
    if sbnr > ebnr {
        return None;
    }
    Some((sbnr, ebnr))
}

/// Bits that must be set after `size` bytes at `sector` went out of sync.
/// Every block the range touches qualifies.
pub fn out_of_sync_bit_range(sector: Sector, size: u32, capacity: Sector) -> Option<(u64, u64)> {
    if size == 0 || sector >= capacity {
        return None;
    }
    let mut esector = sector + (size as u64 >> SECTOR_SHIFT) - 1;
    if esector >= capacity {
        esector = capacity - 1;
    }
    Some((sect_to_bit(sector), sect_to_bit(esector)))
}

/// Out-of-sync bitmap operations consumed by the resync engine.
pub trait Bitmap: Send + Sync {
    /// Number of bits in the bitmap.
    fn bits(&self) -> u64;

    /// Next set bit at or after `from`, or None at end of bitmap.
    fn find_next(&self, from: u64) -> Option<u64>;

    /// True if `bit` is set. Out-of-range bits read as clear.
    fn test_bit(&self, bit: u64) -> bool;

    /// Number of set bits.
    fn total_weight(&self) -> u64;

    /// Clear bits `first..=last`, returning how many were set before.
    fn clear_bits(&self, first: u64, last: u64) -> u64;

    /// Set bits `first..=last`, returning how many were clear before.
    fn set_bits(&self, first: u64, last: u64) -> u64;
}

struct BitmapInner {
    words: Vec<u64>,
    weight: u64,
}

/// Word-vector bitmap held in memory.
pub struct InMemoryBitmap {
    bits: u64,
    inner: RwLock<BitmapInner>,
}

impl InMemoryBitmap {
    /// Create a bitmap with `bits` bits, all clear.
    pub fn new(bits: u64) -> Self {
        let words = vec![0u64; bits.div_ceil(64) as usize];
        Self {
            bits,
            inner: RwLock::new(BitmapInner { words, weight: 0 }),
        }
    }

    /// Create a bitmap sized for a device of `capacity` sectors.
    pub fn for_capacity(capacity: Sector) -> Self {
        Self::new(capacity.div_ceil(BM_SECT_PER_BIT))
    }

    /// Create a bitmap from a list of booleans (true = out of sync).
    pub fn from_bools(dirty: &[bool]) -> Self {
        let bm = Self::new(dirty.len() as u64);
        for (i, d) in dirty.iter().enumerate() {
            if *d {
                bm.set_bits(i as u64, i as u64);
            }
        }
        bm
    }

    /// Set every bit (full resync).
    pub fn set_all(&self) {
        if self.bits > 0 {
            self.set_bits(0, self.bits - 1);
        }
    }
}

impl Bitmap for InMemoryBitmap {
    fn bits(&self) -> u64 {
        self.bits
    }

    fn find_next(&self, from: u64) -> Option<u64> {
        if from >= self.bits {
            return None;
        }
        let inner = self.inner.read();
        let mut word_idx = (from / 64) as usize;
        let mut word = inner.words[word_idx] & (!0u64 << (from % 64));
        loop {
            if word != 0 {
                let bit = word_idx as u64 * 64 + word.trailing_zeros() as u64;
                return if bit < self.bits { Some(bit) } else { None };
            }
            word_idx += 1;
            if word_idx >= inner.words.len() {
                return None;
            }
            word = inner.words[word_idx];
        }
    }

    fn test_bit(&self, bit: u64) -> bool {
        if bit >= self.bits {
            return false;
        }
        let inner = self.inner.read();
        inner.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    fn total_weight(&self) -> u64 {
        self.inner.read().weight
    }

    fn clear_bits(&self, first: u64, last: u64) -> u64 {
        let last = last.min(self.bits.saturating_sub(1));
        if first > last || self.bits == 0 {
            return 0;
        }
        let mut inner = self.inner.write();
        let mut changed = 0;
        for bit in first..=last {
            let mask = 1u64 << (bit % 64);
            let word = &mut inner.words[(bit / 64) as usize];
            if *word & mask != 0 {
                *word &= !mask;
                changed += 1;
            }
        }
        inner.weight -= changed;
        changed
    }

    fn set_bits(&self, first: u64, last: u64) -> u64 {
        let last = last.min(self.bits.saturating_sub(1));
        if first > last || self.bits == 0 {
            return 0;
        }
        let mut inner = self.inner.write();
        let mut changed = 0;
        for bit in first..=last {
            let mask = 1u64 << (bit % 64);
            let word = &mut inner.words[(bit / 64) as usize];
            if *word & mask == 0 {
                *word |= mask;
                changed += 1;
            }
        }
        inner.weight += changed;
        changed
    }
}
