//! Page-table identities of composite protection domains and their
//! activation on the current core. Populating the tables is the memory
//! manager's job and happens outside the kernel core.

use bit_field::BitField;

use crate::config::{MAX_MPD_DESC, PAGE_BITS, PGTBL_POOL_BASE};

/// Physical address of a page-table root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PgTbl(pub usize);

const POOL_WORDS: usize = (MAX_MPD_DESC + 63) / 64;

/// Bitmap allocator over the page-table roots reserved for composites.
pub struct PgTblPool {
    bitmap: [u64; POOL_WORDS],
}

impl PgTblPool {
    pub const fn new() -> Self {
        Self { bitmap: [0; POOL_WORDS] }
    }

    pub fn allocate(&mut self) -> Option<PgTbl> {
        let index = (0..MAX_MPD_DESC).find(|i| !self.bitmap[i / 64].get_bit(i % 64))?;
        self.bitmap[index / 64].set_bit(index % 64, true);
        Some(PgTbl(PGTBL_POOL_BASE + (index << PAGE_BITS)))
    }

    pub fn release(&mut self, pg: PgTbl) {
        let index = (pg.0 - PGTBL_POOL_BASE) >> PAGE_BITS;
        assert!(self.bitmap[index / 64].get_bit(index % 64), "double free of page table {:#x}", pg.0);
        self.bitmap[index / 64].set_bit(index % 64, false);
    }

    pub fn in_use(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    pub fn available(&self) -> usize {
        MAX_MPD_DESC - self.in_use()
    }
}

impl Default for PgTblPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "riscv64")]
fn write_root(pg: PgTbl) {
    use riscv::register::satp;

    unsafe {
        satp::set(satp::Mode::Sv39, 0, pg.0 >> PAGE_BITS);
        riscv::asm::sfence_vma_all();
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn write_root(_pg: PgTbl) {}

/// The page table loaded on this core.
pub struct VSpace {
    active: Option<PgTbl>,
    loads: usize,
}

impl VSpace {
    pub const fn new() -> Self {
        Self { active: None, loads: 0 }
    }

    #[inline]
    pub fn active(&self) -> Option<PgTbl> {
        self.active
    }

    /// Loads `new` unless it is already active; reloading the same root
    /// would only flush the TLB.
    #[inline]
    pub fn switch_pg_tbls(&mut self, new: PgTbl) -> bool {
        if self.active == Some(new) {
            return false;
        }
        write_root(new);
        self.active = Some(new);
        self.loads += 1;
        true
    }

    #[inline]
    pub fn loads(&self) -> usize {
        self.loads
    }
}

impl Default for VSpace {
    fn default() -> Self {
        Self::new()
    }
}
