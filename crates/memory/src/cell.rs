//! A contiguous byte region tagged with a page range: the leaf type routed to by the
//! [`SystemBus`](crate::bus::SystemBus). RAM and ROM are the same shape; only the write policy
//! differs, so both are constructed through [`MemoryCell::new`] with a `readonly` flag.

use snafu::prelude::*;

/// Error conditions when accessing a [`MemoryCell`] directly (bypassing the bus).
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// Thrown when an address's page lies outside the cell's declared range.
    #[snafu(display("Address {address:#010X} is out of bounds for this memory cell"))]
    OutOfBounds { address: u32 },
    /// Thrown on a runtime write to a ROM cell.
    #[snafu(display("Address {address:#010X} is write-protected"))]
    WriteProtected { address: u32 },
}
pub type Result<T> = core::result::Result<T, Error>;

/// A byte-addressable region spanning pages `[lo_page, hi_page]` inclusive.
///
/// Both RAM and ROM are represented by this type; ROM simply sets `readonly`. [`reset`](Self::reset)
/// restores the region to its initial contents: all-zero for RAM, the original image for ROM.
pub struct MemoryCell {
    lo_page: u32,
    hi_page: u32,
    data: Box<[u8]>,
    initial: Box<[u8]>,
    readonly: bool,
}

impl MemoryCell {
    /// Creates a new cell spanning pages `[lo_page, hi_page]` (inclusive), optionally pre-loaded
    /// with `initial` bytes (zero-padded or truncated to the region's size).
    #[must_use]
    pub fn new(lo_page: u32, hi_page: u32, initial: Option<&[u8]>, readonly: bool) -> Self {
        let size = ((hi_page - lo_page + 1) as usize) * basm_core::addr::PAGE_SIZE as usize;
        let mut buf = vec![0u8; size].into_boxed_slice();
        if let Some(bytes) = initial {
            let len = bytes.len().min(size);
            buf[..len].copy_from_slice(&bytes[..len]);
        }
        Self { lo_page, hi_page, initial: buf.clone(), data: buf, readonly }
    }

    /// Constructs a RAM cell (writable, zero-initialized unless `initial` is given).
    #[must_use]
    pub fn ram(lo_page: u32, hi_page: u32, initial: Option<&[u8]>) -> Self {
        Self::new(lo_page, hi_page, initial, false)
    }

    /// Constructs a ROM cell (read-only after construction).
    #[must_use]
    pub fn rom(lo_page: u32, hi_page: u32, image: &[u8]) -> Self {
        Self::new(lo_page, hi_page, Some(image), true)
    }

    #[must_use]
    pub fn lo_page(&self) -> u32 {
        self.lo_page
    }

    #[must_use]
    pub fn hi_page(&self) -> u32 {
        self.hi_page
    }

    #[must_use]
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Returns `true` if `address`'s page lies within this cell's declared range.
    #[must_use]
    pub fn in_bounds(&self, address: u32) -> bool {
        let page = basm_core::addr::page_of(address);
        page >= self.lo_page && page <= self.hi_page
    }

    fn local_offset(&self, address: u32) -> usize {
        (address - basm_core::addr::page_base(self.lo_page)) as usize
    }

    /// Reads a single byte.
    ///
    /// # Errors
    /// Returns [`OutOfBounds`](Error::OutOfBounds) if `address` isn't in this cell's range.
    pub fn read_byte(&self, address: u32) -> Result<u8> {
        ensure!(self.in_bounds(address), OutOfBoundsSnafu { address });
        Ok(self.data[self.local_offset(address)])
    }

    /// Writes a single byte.
    ///
    /// # Errors
    /// Returns [`OutOfBounds`](Error::OutOfBounds) if `address` isn't in this cell's range, or
    /// [`WriteProtected`](Error::WriteProtected) if this is a ROM cell.
    pub fn write_byte(&mut self, address: u32, value: u8) -> Result<()> {
        ensure!(self.in_bounds(address), OutOfBoundsSnafu { address });
        ensure!(!self.readonly, WriteProtectedSnafu { address });
        let offset = self.local_offset(address);
        self.data[offset] = value;
        Ok(())
    }

    /// Restores the cell to its initial contents (all-zero for RAM, original image for ROM).
    pub fn reset(&mut self) {
        self.data.copy_from_slice(&self.initial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_read_write_round_trip() {
        let mut cell = MemoryCell::ram(0, 0, None);
        cell.write_byte(0x10, 0x42).unwrap();
        assert_eq!(cell.read_byte(0x10).unwrap(), 0x42);
    }

    #[test]
    fn rom_rejects_runtime_writes() {
        let mut cell = MemoryCell::rom(0, 0, &[1, 2, 3]);
        assert_eq!(cell.read_byte(1).unwrap(), 2);
        assert_eq!(cell.write_byte(0, 9), Err(Error::WriteProtected { address: 0 }));
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let cell = MemoryCell::ram(1, 1, None);
        assert_eq!(cell.read_byte(0), Err(Error::OutOfBounds { address: 0 }));
        let page_size = basm_core::addr::PAGE_SIZE;
        assert!(cell.read_byte(page_size).is_ok());
        assert!(cell.read_byte(page_size * 2).is_err());
    }

    #[test]
    fn reset_restores_ram_to_zero() {
        let mut cell = MemoryCell::ram(0, 0, None);
        cell.write_byte(4, 0xFF).unwrap();
        cell.reset();
        assert_eq!(cell.read_byte(4).unwrap(), 0);
    }

    #[test]
    fn reset_restores_rom_to_original_image() {
        let mut cell = MemoryCell::rom(0, 0, &[9, 9, 9]);
        // ROM can't be written at runtime, but reset must still be idempotent.
        cell.reset();
        assert_eq!(cell.read_byte(0).unwrap(), 9);
    }
}
