// Physical page accounting and user address spaces
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KResult, KernelError};
use crate::param::{pg_round_down, pg_round_up, PGSIZE};

/// Fixed supply of physical pages.
///
/// Every kernel allocation that stands for a page (register snapshots, kernel
/// stacks, user memory) draws from the pool, so running out is observable and
/// every failure path can be checked for leaks.
pub struct PagePool {
    total: usize,
    free: AtomicUsize,
}

impl PagePool {
    pub fn new(pages: usize) -> Self {
        Self {
            total: pages,
            free: AtomicUsize::new(pages),
        }
    }

    pub fn total_pages(&self) -> usize {
        self.total
    }

    pub fn free_pages(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn give(&self) {
        let prev = self.free.fetch_add(1, Ordering::AcqRel);
        if prev >= self.total {
            panic!("kfree: page pool overflow");
        }
    }

    /// Allocate one page holding `value`. `None` when the pool is empty.
    pub fn kalloc<T>(&'static self, value: T) -> Option<Frame<T>> {
        assert!(core::mem::size_of::<T>() <= PGSIZE, "kalloc: object larger than a page");
        if !self.take() {
            return None;
        }
        Some(Frame {
            pool: self,
            value: Box::new(value),
        })
    }
}

/// A page owned by the kernel; returned to its pool on drop.
pub struct Frame<T> {
    pool: &'static PagePool,
    value: Box<T>,
}

impl<T> Deref for Frame<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Frame<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for Frame<T> {
    fn drop(&mut self) {
        self.pool.give();
    }
}

type Page = [u8; PGSIZE];

/// Root of a page table; only its page is accounted for.
struct PageTableRoot;

/// A user address space: the pages mapped at `[0, sz)`.
pub struct AddressSpace {
    pool: &'static PagePool,
    _root: Frame<PageTableRoot>,
    pages: BTreeMap<usize, Frame<Page>>,
}

impl AddressSpace {
    /// Create an empty address space.
    pub fn create(pool: &'static PagePool) -> KResult<Self> {
        let root = pool
            .kalloc(PageTableRoot)
            .ok_or(KernelError::ResourceAllocationFailure)?;
        Ok(Self {
            pool,
            _root: root,
            pages: BTreeMap::new(),
        })
    }

    /// Map zeroed pages to grow the space from `old_sz` to `new_sz`.
    ///
    /// On failure everything mapped by this call is unmapped again.
    pub fn grow(&mut self, old_sz: usize, new_sz: usize) -> KResult<usize> {
        if new_sz < old_sz {
            return Ok(old_sz);
        }
        let start = pg_round_up(old_sz);
        let mut va = start;
        while va < new_sz {
            match self.pool.kalloc([0u8; PGSIZE]) {
                Some(page) => {
                    self.pages.insert(va / PGSIZE, page);
                }
                None => {
                    self.unmap(start, va);
                    return Err(KernelError::ResourceAllocationFailure);
                }
            }
            va += PGSIZE;
        }
        Ok(new_sz)
    }

    /// Unmap pages to shrink the space from `old_sz` to `new_sz`.
    pub fn shrink(&mut self, old_sz: usize, new_sz: usize) -> usize {
        if new_sz >= old_sz {
            return old_sz;
        }
        self.unmap(pg_round_up(new_sz), pg_round_up(old_sz));
        new_sz
    }

    fn unmap(&mut self, from: usize, to: usize) {
        let mut va = from;
        while va < to {
            self.pages.remove(&(va / PGSIZE));
            va += PGSIZE;
        }
    }

    /// Copy the first `sz` bytes of this space into `child`, page by page.
    ///
    /// On failure the pages already copied are unmapped from `child`.
    pub fn copy_into(&self, child: &mut AddressSpace, sz: usize) -> KResult<()> {
        let mut va = 0;
        while va < sz {
            let src = match self.pages.get(&(va / PGSIZE)) {
                Some(page) => page,
                None => panic!("uvmcopy: page not present"),
            };
            match child.pool.kalloc(**src) {
                Some(page) => {
                    child.pages.insert(va / PGSIZE, page);
                }
                None => {
                    child.unmap(0, va);
                    return Err(KernelError::ResourceAllocationFailure);
                }
            }
            va += PGSIZE;
        }
        Ok(())
    }

    /// Copy `src` to user address `va`.
    pub fn copy_out(&mut self, va: u64, src: &[u8]) -> KResult<()> {
        let mut va = usize::try_from(va).map_err(|_| KernelError::BadAddress)?;
        let mut src = src;
        while !src.is_empty() {
            let base = pg_round_down(va);
            let page = self
                .pages
                .get_mut(&(base / PGSIZE))
                .ok_or(KernelError::BadAddress)?;
            let off = va - base;
            let n = (PGSIZE - off).min(src.len());
            page[off..off + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            va = base + PGSIZE;
        }
        Ok(())
    }

    /// Copy from user address `va` into `dst`.
    pub fn copy_in(&self, va: u64, dst: &mut [u8]) -> KResult<()> {
        let mut va = usize::try_from(va).map_err(|_| KernelError::BadAddress)?;
        let mut dst = dst;
        while !dst.is_empty() {
            let base = pg_round_down(va);
            let page = self
                .pages
                .get(&(base / PGSIZE))
                .ok_or(KernelError::BadAddress)?;
            let off = va - base;
            let n = (PGSIZE - off).min(dst.len());
            dst[..n].copy_from_slice(&page[off..off + n]);
            dst = &mut dst[n..];
            va = base + PGSIZE;
        }
        Ok(())
    }

    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pages: usize) -> &'static PagePool {
        Box::leak(Box::new(PagePool::new(pages)))
    }

    #[test]
    fn frames_return_to_pool() {
        let pool = pool(2);
        let a = pool.kalloc(1u64).unwrap();
        let b = pool.kalloc(2u64).unwrap();
        assert!(pool.kalloc(3u64).is_none());
        assert_eq!(*a + *b, 3);
        drop(a);
        assert_eq!(pool.free_pages(), 1);
        drop(b);
        assert_eq!(pool.free_pages(), 2);
    }

    #[test]
    fn failed_grow_unmaps_partial_work() {
        let pool = pool(3);
        let mut space = AddressSpace::create(pool).unwrap();
        assert_eq!(space.grow(0, PGSIZE).unwrap(), PGSIZE);
        assert_eq!(pool.free_pages(), 1);
        assert_eq!(
            space.grow(PGSIZE, 3 * PGSIZE),
            Err(KernelError::ResourceAllocationFailure)
        );
        assert_eq!(space.mapped_pages(), 1);
        assert_eq!(pool.free_pages(), 1);
    }

    #[test]
    fn copy_in_out_crosses_pages() {
        let pool = pool(4);
        let mut space = AddressSpace::create(pool).unwrap();
        space.grow(0, 2 * PGSIZE).unwrap();
        let data = [7u8; 16];
        space.copy_out(PGSIZE as u64 - 8, &data).unwrap();
        let mut back = [0u8; 16];
        space.copy_in(PGSIZE as u64 - 8, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(
            space.copy_out(2 * PGSIZE as u64 - 4, &data),
            Err(KernelError::BadAddress)
        );
    }

    #[test]
    fn copy_is_private_and_unwinds_on_failure() {
        let pool = pool(5);
        let mut parent = AddressSpace::create(pool).unwrap();
        parent.grow(0, 2 * PGSIZE).unwrap();
        parent.copy_out(0, b"parent").unwrap();

        let mut child = AddressSpace::create(pool).unwrap();
        assert_eq!(
            parent.copy_into(&mut child, 2 * PGSIZE),
            Err(KernelError::ResourceAllocationFailure)
        );
        assert_eq!(child.mapped_pages(), 0);
        assert_eq!(pool.free_pages(), 1);

        parent.shrink(2 * PGSIZE, PGSIZE);
        parent.copy_into(&mut child, PGSIZE).unwrap();
        child.copy_out(0, b"child!").unwrap();
        let mut buf = [0u8; 6];
        parent.copy_in(0, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }
}
