//! Paged virtual memory: page table, TLB, and disk-backed swap with second-chance eviction.
//!
//! See [`VirtualMemoryUnit::translate`] for the full algorithm. All state changes within one
//! `translate` call (TLB install, page-table update, disk I/O) are applied only once every
//! sub-step succeeds, so a failing disk write-back leaves the faulting PTE untouched.

use basm_core::addr::PAGE_SIZE;
use hashbrown::HashMap;
use snafu::prelude::*;

/// Number of TLB entries kept resident at once.
pub const TLB_CAPACITY: usize = 16;

/// Error conditions raised while translating a virtual address.
#[derive(Debug, Snafu, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum Error {
    /// Thrown when a page fault's disk read or write-back fails.
    #[snafu(display("Disk I/O failed servicing a page fault for vpage {vpage:#X}"))]
    DiskFailure { vpage: u32 },
    /// Thrown when fault handling re-enters itself (fault during fault servicing).
    #[snafu(display("Fault occurred while already servicing a fault for vpage {vpage:#X}"))]
    FaultDuringFault { vpage: u32 },
}
pub type Result<T> = core::result::Result<T, Error>;

#[derive(Clone, Copy)]
struct PageTableEntry {
    frame: u32,
    present: bool,
    dirty: bool,
    disk_slot: Option<u32>,
}

impl PageTableEntry {
    const fn absent() -> Self {
        Self { frame: 0, present: false, dirty: false, disk_slot: None }
    }
}

#[derive(Clone, Copy)]
struct TlbEntry {
    vpage: u32,
    frame: u32,
    recency: u64,
}

struct Tlb {
    entries: Vec<Option<TlbEntry>>,
    clock: u64,
}

impl Tlb {
    fn new() -> Self {
        Self { entries: vec![None; TLB_CAPACITY], clock: 0 }
    }

    fn lookup(&mut self, vpage: u32) -> Option<u32> {
        self.clock += 1;
        let clock = self.clock;
        for slot in &mut self.entries {
            if let Some(entry) = slot {
                if entry.vpage == vpage {
                    entry.recency = clock;
                    return Some(entry.frame);
                }
            }
        }
        None
    }

    fn install(&mut self, vpage: u32, frame: u32) {
        self.clock += 1;
        let clock = self.clock;
        // Refresh an existing mapping in place, if present.
        for slot in &mut self.entries {
            if let Some(entry) = slot {
                if entry.vpage == vpage {
                    entry.frame = frame;
                    entry.recency = clock;
                    return;
                }
            }
        }
        if let Some(slot) = self.entries.iter_mut().find(|s| s.is_none()) {
            *slot = Some(TlbEntry { vpage, frame, recency: clock });
            return;
        }
        // Evict the least-recently-used entry.
        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.as_ref().map(|e| e.recency).unwrap_or(0))
            .map(|(i, _)| i)
            .expect("TLB_CAPACITY is nonzero");
        self.entries[victim] = Some(TlbEntry { vpage, frame, recency: clock });
    }

    fn invalidate(&mut self, vpage: u32) {
        for slot in &mut self.entries {
            if slot.as_ref().is_some_and(|e| e.vpage == vpage) {
                *slot = None;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.iter().filter(|s| s.is_some()).count()
    }
}

/// Owns the page table, TLB, and disk-backed swap store for one address space.
pub struct VirtualMemoryUnit {
    page_table: HashMap<u32, PageTableEntry>,
    tlb: Tlb,
    disk: HashMap<u32, Box<[u8]>>,
    next_disk_slot: u32,
    frame_owner: Vec<Option<u32>>, // indexed by frame: which vpage (if any) occupies it
    frame_reference: Vec<bool>,    // second-chance reference bit, indexed by frame
    free_frames: Vec<u32>,
    clock_hand: usize,
    servicing_fault: bool,
    /// Resident physical memory, one `PAGE_SIZE` slot per frame. The bus only ever touches pages
    /// through [`VirtualMemoryUnit::translate`]'s returned physical address into this store.
    frame_storage: Vec<Box<[u8]>>,
}

impl VirtualMemoryUnit {
    /// Creates a VM unit backed by `frame_count` physical frames.
    #[must_use]
    pub fn new(frame_count: u32) -> Self {
        Self {
            page_table: HashMap::new(),
            tlb: Tlb::new(),
            disk: HashMap::new(),
            next_disk_slot: 0,
            frame_owner: vec![None; frame_count as usize],
            frame_reference: vec![false; frame_count as usize],
            free_frames: (0..frame_count).rev().collect(),
            clock_hand: 0,
            servicing_fault: false,
            frame_storage: (0..frame_count)
                .map(|_| vec![0u8; PAGE_SIZE as usize].into_boxed_slice())
                .collect(),
        }
    }

    /// Reads a byte from physical frame storage at `physical_addr` (as returned by
    /// [`translate`](Self::translate)).
    #[must_use]
    pub fn read_physical(&self, physical_addr: u32) -> u8 {
        let frame = physical_addr / PAGE_SIZE;
        let offset = physical_addr % PAGE_SIZE;
        self.frame_storage[frame as usize][offset as usize]
    }

    /// Writes a byte to physical frame storage at `physical_addr`.
    pub fn write_physical(&mut self, physical_addr: u32, value: u8) {
        let frame = physical_addr / PAGE_SIZE;
        let offset = physical_addr % PAGE_SIZE;
        self.frame_storage[frame as usize][offset as usize] = value;
    }

    /// Number of valid TLB entries currently cached.
    #[must_use]
    pub fn tlb_len(&self) -> usize {
        self.tlb.len()
    }

    /// Translates a virtual byte address to a physical byte address, bringing the page in from
    /// disk (or zero-filling it) and evicting a victim frame if necessary. `for_write` marks the
    /// resulting page-table entry dirty once the access completes.
    ///
    /// # Errors
    /// Returns [`DiskFailure`](Error::DiskFailure) if a required disk read or write-back cannot be
    /// serviced, or [`FaultDuringFault`](Error::FaultDuringFault) if fault handling re-enters itself.
    pub fn translate(&mut self, vaddr: u32, for_write: bool) -> Result<u32> {
        let vpage = basm_core::addr::page_of(vaddr);
        let offset = basm_core::addr::offset_of(vaddr);

        if let Some(frame) = self.tlb.lookup(vpage) {
            if for_write {
                if let Some(pte) = self.page_table.get_mut(&vpage) {
                    pte.dirty = true;
                }
            }
            self.frame_reference[frame as usize] = true;
            return Ok(frame * PAGE_SIZE + offset);
        }

        let present_frame = self.page_table.get(&vpage).filter(|pte| pte.present).map(|pte| pte.frame);
        let frame = if let Some(frame) = present_frame {
            frame
        } else {
            self.handle_fault(vpage)?
        };

        self.tlb.install(vpage, frame);
        self.frame_reference[frame as usize] = true;
        if for_write {
            self.page_table.entry(vpage).or_insert_with(PageTableEntry::absent).dirty = true;
        }
        Ok(frame * PAGE_SIZE + offset)
    }

    fn handle_fault(&mut self, vpage: u32) -> Result<u32> {
        ensure!(!self.servicing_fault, FaultDuringFaultSnafu { vpage });
        self.servicing_fault = true;
        let result = self.handle_fault_inner(vpage);
        self.servicing_fault = false;
        result
    }

    fn handle_fault_inner(&mut self, vpage: u32) -> Result<u32> {
        let frame = match self.free_frames.pop() {
            Some(frame) => frame,
            None => self.evict_victim()?,
        };

        let disk_slot = self.page_table.get(&vpage).and_then(|pte| pte.disk_slot);
        let page_bytes = match disk_slot {
            Some(slot) => self.disk.get(&slot).cloned().ok_or(Error::DiskFailure { vpage })?,
            None => vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
        };
        self.frame_data_mut(frame, |buf| buf.copy_from_slice(&page_bytes));

        self.frame_owner[frame as usize] = Some(vpage);
        self.frame_reference[frame as usize] = false;
        self.page_table.insert(
            vpage,
            PageTableEntry { frame, present: true, dirty: false, disk_slot },
        );
        Ok(frame)
    }

    /// Clock (second-chance) policy over physical frames: sweep giving each frame one reprieve
    /// via its reference bit before evicting the first frame found already clear.
    fn evict_victim(&mut self) -> Result<u32> {
        let frame_count = self.frame_owner.len();
        loop {
            let frame = self.clock_hand as u32;
            self.clock_hand = (self.clock_hand + 1) % frame_count;

            if self.frame_reference[frame as usize] {
                self.frame_reference[frame as usize] = false;
                continue;
            }

            let victim_vpage = self.frame_owner[frame as usize]
                .expect("a frame with no owner would still be on the free list");
            let pte = *self.page_table.get(&victim_vpage).expect("frame owner implies a PTE");

            let slot = if pte.dirty {
                let slot = pte.disk_slot.unwrap_or_else(|| self.allocate_disk_slot());
                let mut bytes = vec![0u8; PAGE_SIZE as usize].into_boxed_slice();
                self.frame_data(frame, |buf| bytes.copy_from_slice(buf));
                self.disk.insert(slot, bytes);
                Some(slot)
            } else {
                pte.disk_slot
            };

            self.page_table.insert(
                victim_vpage,
                PageTableEntry { frame: pte.frame, present: false, dirty: false, disk_slot: slot },
            );
            self.tlb.invalidate(victim_vpage);
            return Ok(frame);
        }
    }

    fn allocate_disk_slot(&mut self) -> u32 {
        let slot = self.next_disk_slot;
        self.next_disk_slot += 1;
        slot
    }

    fn frame_data(&self, frame: u32, f: impl FnOnce(&[u8])) {
        f(&self.frame_storage[frame as usize]);
    }

    fn frame_data_mut(&mut self, frame: u32, f: impl FnOnce(&mut [u8])) {
        f(&mut self.frame_storage[frame as usize]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_touch_zero_fills_and_caches_in_tlb() {
        let mut vm = VirtualMemoryUnit::new(4);
        let phys = vm.translate(0x0000_1000, false).unwrap();
        assert_eq!(vm.read_physical(phys), 0);
        assert_eq!(vm.tlb_len(), 1);
    }

    #[test]
    fn write_then_read_round_trips_through_same_page() {
        let mut vm = VirtualMemoryUnit::new(4);
        let phys = vm.translate(0x2004, true).unwrap();
        vm.write_physical(phys, 0xAB);
        let phys_again = vm.translate(0x2004, false).unwrap();
        assert_eq!(vm.read_physical(phys_again), 0xAB);
    }

    #[test]
    fn eviction_preserves_dirty_page_contents_across_faults() {
        // Only 2 frames: touching 3 distinct pages forces an eviction.
        let mut vm = VirtualMemoryUnit::new(2);
        let p0 = vm.translate(0x0000_0000, true).unwrap();
        vm.write_physical(p0, 0x11);
        let p1 = vm.translate(0x0000_1000, true).unwrap();
        vm.write_physical(p1, 0x22);
        // Touching a third page must evict one of the first two (both resident, neither
        // referenced recently enough to survive a second sweep in a 2-frame clock).
        let _p2 = vm.translate(0x0000_2000, false).unwrap();

        // Whichever of page 0 or page 1 was evicted, re-faulting it must restore its byte.
        let phys0 = vm.translate(0x0000_0000, false).unwrap();
        assert_eq!(vm.read_physical(phys0), 0x11);
    }

    #[test]
    fn tlb_invalidation_on_eviction_forces_retranslation() {
        let mut vm = VirtualMemoryUnit::new(1);
        vm.translate(0x0000_0000, false).unwrap();
        assert_eq!(vm.tlb_len(), 1);
        // Only one frame: the second distinct page must evict page 0's mapping.
        vm.translate(0x0000_1000, false).unwrap();
        assert_eq!(vm.tlb_len(), 1);
    }

    #[test]
    fn reentrant_fault_is_rejected() {
        let mut vm = VirtualMemoryUnit::new(1);
        vm.servicing_fault = true;
        assert_eq!(vm.handle_fault(0), Err(Error::FaultDuringFault { vpage: 0 }));
    }
}
