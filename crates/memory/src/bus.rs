//! Routes byte accesses to the [`MemoryCell`] whose page range contains the address, optionally
//! translating through the [`VirtualMemoryUnit`] first.
//!
//! The VM unit lives as a field here rather than the bus living inside the VM unit: the two
//! types would otherwise need to reference each other (the VM unit services faults by reading
//! physical frames, the bus needs the VM unit to translate virtual addresses), so ownership only
//! flows one way.

use crate::cell::MemoryCell;
use crate::vm::VirtualMemoryUnit;
use snafu::prelude::*;

/// Error conditions raised while routing or performing a bus access.
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// No installed cell covers this address.
    #[snafu(display("Address {address:#010X} is not mapped to any memory cell"))]
    InvalidAddress { address: u32 },
    /// More than one installed cell covers this address.
    #[snafu(display("Address {address:#010X} is claimed by more than one memory cell"))]
    ConflictAddresses { address: u32 },
    /// An access width other than 1, 2, 4, or 8 bytes was requested.
    #[snafu(display("Access width {width} is not supported"))]
    InvalidWidth { width: usize },
    #[snafu(display("{source}"), context(false))]
    Cell { source: crate::cell::Error },
    #[snafu(display("{source}"), context(false))]
    Vm { source: crate::vm::Error },
}
pub type Result<T> = core::result::Result<T, Error>;

/// Owns every installed [`MemoryCell`] and the [`VirtualMemoryUnit`] servicing paged accesses.
pub struct SystemBus {
    cells: Vec<MemoryCell>,
    vm: VirtualMemoryUnit,
}

impl SystemBus {
    /// Builds a bus with no cells installed yet, backed by `frame_count` physical VM frames.
    #[must_use]
    pub fn new(frame_count: u32) -> Self {
        Self { cells: Vec::new(), vm: VirtualMemoryUnit::new(frame_count) }
    }

    /// Installs a cell. Overlap with an already-installed cell is only detected at access time
    /// (per [`route`](Self::route)'s [`ConflictAddresses`](Error::ConflictAddresses)), matching
    /// the original bus's lazy validation.
    pub fn attach(&mut self, cell: MemoryCell) {
        self.cells.push(cell);
    }

    /// Finds the unique cell covering `address`.
    ///
    /// # Errors
    /// [`InvalidAddress`](Error::InvalidAddress) if no cell covers it, or
    /// [`ConflictAddresses`](Error::ConflictAddresses) if more than one does.
    pub fn route(&self, address: u32) -> Result<&MemoryCell> {
        let mut found = None;
        for cell in &self.cells {
            if cell.in_bounds(address) {
                ensure!(found.is_none(), ConflictAddressesSnafu { address });
                found = Some(cell);
            }
        }
        found.ok_or(Error::InvalidAddress { address })
    }

    fn route_mut(&mut self, address: u32) -> Result<&mut MemoryCell> {
        let mut found = None;
        for (i, cell) in self.cells.iter().enumerate() {
            if cell.in_bounds(address) {
                ensure!(found.is_none(), ConflictAddressesSnafu { address });
                found = Some(i);
            }
        }
        let i = found.ok_or(Error::InvalidAddress { address })?;
        Ok(&mut self.cells[i])
    }

    /// Reads `n` (1, 2, 4, or 8) little-endian bytes starting at `addr`. When `memory_mapped`,
    /// each byte is translated individually through the VM unit into its own physical frame
    /// store, so a read straddling a page boundary may legitimately fault on its second page
    /// after its first succeeds; otherwise `addr` is routed directly to an installed cell
    /// (ROM, memory-mapped devices, or unpaged RAM).
    ///
    /// # Errors
    /// [`InvalidWidth`](Error::InvalidWidth) if `n` isn't 1/2/4/8, plus routing and VM errors.
    pub fn read_val(&mut self, addr: u32, n: usize, memory_mapped: bool) -> Result<u64> {
        ensure!(matches!(n, 1 | 2 | 4 | 8), InvalidWidthSnafu { width: n });
        let mut value: u64 = 0;
        for i in 0..n {
            let byte_addr = addr.wrapping_add(i as u32);
            let byte = if memory_mapped {
                let phys = self.vm.translate(byte_addr, false)?;
                self.vm.read_physical(phys)
            } else {
                self.route(byte_addr)?.read_byte(byte_addr)?
            };
            value |= (byte as u64) << (8 * i);
        }
        Ok(value)
    }

    /// Writes `n` (1, 2, 4, or 8) little-endian bytes of `value` starting at `addr`. See
    /// [`read_val`](Self::read_val) for the `memory_mapped` routing rule.
    ///
    /// # Errors
    /// [`InvalidWidth`](Error::InvalidWidth) if `n` isn't 1/2/4/8, plus routing and VM errors.
    pub fn write_val(&mut self, addr: u32, value: u64, n: usize, memory_mapped: bool) -> Result<()> {
        ensure!(matches!(n, 1 | 2 | 4 | 8), InvalidWidthSnafu { width: n });
        for i in 0..n {
            let byte_addr = addr.wrapping_add(i as u32);
            let byte = ((value >> (8 * i)) & 0xFF) as u8;
            if memory_mapped {
                let phys = self.vm.translate(byte_addr, true)?;
                self.vm.write_physical(phys, byte);
            } else {
                self.route_mut(byte_addr)?.write_byte(byte_addr, byte)?;
            }
        }
        Ok(())
    }

    pub fn read_byte(&mut self, addr: u32, memory_mapped: bool) -> Result<u8> {
        Ok(self.read_val(addr, 1, memory_mapped)? as u8)
    }

    pub fn read_hword(&mut self, addr: u32, memory_mapped: bool) -> Result<u16> {
        Ok(self.read_val(addr, 2, memory_mapped)? as u16)
    }

    pub fn read_word(&mut self, addr: u32, memory_mapped: bool) -> Result<u32> {
        Ok(self.read_val(addr, 4, memory_mapped)? as u32)
    }

    pub fn write_byte(&mut self, addr: u32, value: u8, memory_mapped: bool) -> Result<()> {
        self.write_val(addr, value as u64, 1, memory_mapped)
    }

    pub fn write_hword(&mut self, addr: u32, value: u16, memory_mapped: bool) -> Result<()> {
        self.write_val(addr, value as u64, 2, memory_mapped)
    }

    pub fn write_word(&mut self, addr: u32, value: u32, memory_mapped: bool) -> Result<()> {
        self.write_val(addr, value as u64, 4, memory_mapped)
    }

    /// Resets every installed cell to its initial contents. Does not reset VM frame contents or
    /// the TLB; a fresh run should construct a new `SystemBus`.
    pub fn reset_cells(&mut self) {
        for cell in &mut self.cells {
            cell.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with_one_ram_page() -> SystemBus {
        let mut bus = SystemBus::new(4);
        bus.attach(MemoryCell::ram(0, 0, None));
        bus
    }

    #[test]
    fn unmapped_access_reports_invalid_address() {
        let mut bus = bus_with_one_ram_page();
        assert_eq!(bus.read_byte(0x10_0000, false), Err(Error::InvalidAddress { address: 0x10_0000 }));
    }

    #[test]
    fn overlapping_cells_report_conflict() {
        let mut bus = SystemBus::new(4);
        bus.attach(MemoryCell::ram(0, 1, None));
        bus.attach(MemoryCell::ram(1, 2, None));
        assert_eq!(
            bus.read_byte(basm_core::addr::PAGE_SIZE, false),
            Err(Error::ConflictAddresses { address: basm_core::addr::PAGE_SIZE })
        );
    }

    #[test]
    fn word_round_trip_little_endian() {
        let mut bus = bus_with_one_ram_page();
        bus.write_word(0x100, 0x0102_0304, false).unwrap();
        assert_eq!(bus.read_byte(0x100, false).unwrap(), 0x04);
        assert_eq!(bus.read_byte(0x103, false).unwrap(), 0x01);
        assert_eq!(bus.read_word(0x100, false).unwrap(), 0x0102_0304);
    }

    #[test]
    fn invalid_width_is_rejected() {
        let mut bus = bus_with_one_ram_page();
        assert_eq!(bus.read_val(0, 3, false), Err(Error::InvalidWidth { width: 3 }));
    }

    #[test]
    fn memory_mapped_access_goes_through_translation() {
        let mut bus = SystemBus::new(4);
        bus.write_word(0x3000, 0xCAFEBABE, true).unwrap();
        assert_eq!(bus.read_word(0x3000, true).unwrap(), 0xCAFEBABE);
    }

    #[test]
    fn unmapped_address_space_does_not_need_a_cell() {
        let mut bus = SystemBus::new(1);
        // No cell installed at all; paged access works purely off the VM unit's own frames.
        bus.write_byte(0x0, 0x7, true).unwrap();
        assert_eq!(bus.read_byte(0x0, true).unwrap(), 0x7);
    }
}
