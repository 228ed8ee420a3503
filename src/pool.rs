//! Bitmap address allocator over an inclusive IPv4 range.
//!
//! Each address in the range owns one bit, indexed by its offset from the
//! range start. Marking and freeing are O(1); first-fit allocation scans
//! the bitmap a word at a time.
//!
//! [`AddressPool::allocate`] with a hint returns the hinted address only if
//! it is in range and free. Otherwise it silently falls back to first-fit,
//! so callers that need the exact address must compare the result against
//! the hint.

use std::net::Ipv4Addr;

use tracing::warn;

use crate::error::{Error, Result};

const WORD_BITS: u32 = u64::BITS;

/// Inclusive IPv4 range with `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl AddressRange {
    /// Creates a range, rejecting empty or inverted bounds.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if u32::from(start) >= u32::from(end) {
            return Err(Error::InvalidConfig(format!(
                "range start {} must be lower than range end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.start) && addr <= u32::from(self.end)
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.end) - u32::from(self.start)) + 1
    }

    fn offset(&self, ip: Ipv4Addr) -> Option<u32> {
        self.contains(ip)
            .then(|| u32::from(ip) - u32::from(self.start))
    }

    fn address_at(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.start) + offset)
    }
}

/// Tracks which addresses of an [`AddressRange`] are handed out.
#[derive(Debug, Clone)]
pub struct AddressPool {
    range: AddressRange,
    words: Vec<u64>,
    allocated: u64,
}

impl AddressPool {
    pub fn new(range: AddressRange) -> Self {
        let words = range.size().div_ceil(u64::from(WORD_BITS)) as usize;
        Self {
            range,
            words: vec![0; words],
            allocated: 0,
        }
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// Reserves an address.
    ///
    /// With `Some(hint)`, the hint is reserved if it lies in the range and is
    /// free; any other hint falls back to the lowest free address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] when every address is taken.
    pub fn allocate(&mut self, hint: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        if let Some(offset) = hint.and_then(|ip| self.range.offset(ip))
            && !self.test(offset)
        {
            self.set(offset);
            return Ok(self.range.address_at(offset));
        }

        let offset = self.first_free().ok_or(Error::PoolExhausted)?;
        self.set(offset);
        Ok(self.range.address_at(offset))
    }

    /// Returns an address to the pool.
    ///
    /// Returns `false` if the address is outside the range or was not
    /// allocated.
    pub fn free(&mut self, ip: Ipv4Addr) -> bool {
        let Some(offset) = self.range.offset(ip) else {
            warn!("Cannot free {}: outside pool range", ip);
            return false;
        };
        if !self.test(offset) {
            warn!("Cannot free {}: address is not allocated", ip);
            return false;
        }
        self.words[(offset / WORD_BITS) as usize] &= !(1u64 << (offset % WORD_BITS));
        self.allocated -= 1;
        true
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.range
            .offset(ip)
            .is_some_and(|offset| self.test(offset))
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocated
    }

    pub fn free_count(&self) -> u64 {
        self.range.size() - self.allocated
    }

    fn test(&self, offset: u32) -> bool {
        self.words[(offset / WORD_BITS) as usize] & (1u64 << (offset % WORD_BITS)) != 0
    }

    fn set(&mut self, offset: u32) {
        self.words[(offset / WORD_BITS) as usize] |= 1u64 << (offset % WORD_BITS);
        self.allocated += 1;
    }

    fn first_free(&self) -> Option<u32> {
        let size = self.range.size();
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(index, word)| index as u64 * u64::from(WORD_BITS) + u64::from(word.trailing_ones()))
            .filter(|offset| *offset < size)
            .map(|offset| offset as u32)
    }
}
