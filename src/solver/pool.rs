//! Scratch memory pool for solver-local and preconditioner-local vectors.
//!
//! Buffers are kept in size classes keyed by (precision, aligned length).
//! A `Reservation` hands one buffer out exclusively and returns it to its
//! class when dropped, so every exit path of a solve releases its scratch.
//! Returned buffers keep their old contents: the pool never zero-fills.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use crate::error::Result;

use super::backend::Device;

/// Counters describing pool behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Reservations served from an idle buffer.
    pub hits: u64,
    /// Reservations (or pre-reservations) that had to allocate.
    pub misses: u64,
    /// Reservations currently handed out.
    pub outstanding: usize,
    /// Buffers currently idle in the pool.
    pub idle: usize,
    /// Elements held by the pool (idle and outstanding).
    pub elements: usize,
}

/// Idle buffers of one precision, grouped by aligned length.
struct Arena<V> {
    classes: RefCell<BTreeMap<usize, Vec<V>>>,
    stats: Cell<PoolStats>,
}

impl<V> Arena<V> {
    fn new() -> Self {
        Self {
            classes: RefCell::new(BTreeMap::new()),
            stats: Cell::new(PoolStats::default()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut PoolStats)) {
        let mut s = self.stats.get();
        f(&mut s);
        self.stats.set(s);
    }

    fn idle_in(&self, class: usize) -> usize {
        self.classes.borrow().get(&class).map_or(0, Vec::len)
    }

    /// Make sure `count` buffers of `class` elements are idle.
    fn ensure(&self, class: usize, count: usize, alloc: impl Fn(usize) -> Result<V>) -> Result<()> {
        let missing = count.saturating_sub(self.idle_in(class));
        for _ in 0..missing {
            let buf = alloc(class)?;
            self.classes.borrow_mut().entry(class).or_default().push(buf);
            self.update(|s| {
                s.misses += 1;
                s.idle += 1;
                s.elements += class;
            });
        }
        Ok(())
    }

    fn take(&self, class: usize, alloc: impl Fn(usize) -> Result<V>) -> Result<V> {
        let idle = self.classes.borrow_mut().get_mut(&class).and_then(Vec::pop);
        let buf = match idle {
            Some(buf) => {
                self.update(|s| {
                    s.hits += 1;
                    s.idle -= 1;
                });
                buf
            }
            None => {
                let buf = alloc(class)?;
                self.update(|s| {
                    s.misses += 1;
                    s.elements += class;
                });
                buf
            }
        };
        self.update(|s| s.outstanding += 1);
        Ok(buf)
    }

    fn give_back(&self, class: usize, buf: V) {
        self.classes.borrow_mut().entry(class).or_default().push(buf);
        self.update(|s| {
            s.outstanding -= 1;
            s.idle += 1;
        });
    }
}

/// An exclusively held pool buffer, returned to the pool on drop.
///
/// The buffer may be longer than requested (alignment padding); `len()`
/// reports the requested length.
pub struct Reservation<'p, V> {
    buf: Option<V>,
    class: usize,
    len: usize,
    arena: &'p Arena<V>,
}

impl<V> Reservation<'_, V> {
    /// Requested length in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<V> Deref for Reservation<'_, V> {
    type Target = V;

    fn deref(&self) -> &V {
        // Only `Drop` takes the buffer out.
        self.buf.as_ref().unwrap_or_else(|| unreachable!("reservation used after release"))
    }
}

impl<V> DerefMut for Reservation<'_, V> {
    fn deref_mut(&mut self) -> &mut V {
        self.buf.as_mut().unwrap_or_else(|| unreachable!("reservation used after release"))
    }
}

impl<V> Drop for Reservation<'_, V> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.arena.give_back(self.class, buf);
        }
    }
}

/// Process-local pool of device vectors in both of a device's precisions.
///
/// Not thread-safe by construction (`RefCell`): one pool serves one
/// in-flight solve on one rank.
pub struct MemoryPool<D: Device> {
    alignment: usize,
    work: Arena<D::WorkVector>,
    precon: Arena<D::PreconVector>,
}

impl<D: Device> MemoryPool<D> {
    pub fn new(device: &D) -> Self {
        Self {
            alignment: device.mem_pool_alignment().max(1),
            work: Arena::new(),
            precon: Arena::new(),
        }
    }

    /// Alignment unit, in elements.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    fn class_of(&self, len: usize) -> usize {
        len.div_ceil(self.alignment) * self.alignment
    }

    /// Group `(len, count)` needs by size class.
    fn classes_for(&self, needs: &[(usize, usize)]) -> BTreeMap<usize, usize> {
        let mut classes = BTreeMap::new();
        for &(len, count) in needs {
            *classes.entry(self.class_of(len)).or_insert(0) += count;
        }
        classes
    }

    /// Pre-reserve working vectors: for each `(len, count)` make sure `count`
    /// buffers able to hold `len` entries are idle. Needs that fall in the
    /// same size class add up.
    pub fn ensure_work(&self, device: &D, needs: &[(usize, usize)]) -> Result<()> {
        for (class, count) in self.classes_for(needs) {
            self.work.ensure(class, count, |l| device.alloc_work(l))?;
        }
        Ok(())
    }

    /// Pre-reserve preconditioner vectors; see [`MemoryPool::ensure_work`].
    pub fn ensure_precon(&self, device: &D, needs: &[(usize, usize)]) -> Result<()> {
        for (class, count) in self.classes_for(needs) {
            self.precon.ensure(class, count, |l| device.alloc_precon(l))?;
        }
        Ok(())
    }

    /// Hand out a working vector of at least `len` entries.
    pub fn reserve_work(&self, device: &D, len: usize) -> Result<Reservation<'_, D::WorkVector>> {
        let class = self.class_of(len);
        let buf = self.work.take(class, |l| device.alloc_work(l))?;
        Ok(Reservation {
            buf: Some(buf),
            class,
            len,
            arena: &self.work,
        })
    }

    /// Hand out a preconditioner vector of at least `len` entries.
    pub fn reserve_precon(
        &self,
        device: &D,
        len: usize,
    ) -> Result<Reservation<'_, D::PreconVector>> {
        let class = self.class_of(len);
        let buf = self.precon.take(class, |l| device.alloc_precon(l))?;
        Ok(Reservation {
            buf: Some(buf),
            class,
            len,
            arena: &self.precon,
        })
    }

    /// Combined counters over both precisions.
    pub fn stats(&self) -> PoolStats {
        let (w, p) = (self.work.stats.get(), self.precon.stats.get());
        PoolStats {
            hits: w.hits + p.hits,
            misses: w.misses + p.misses,
            outstanding: w.outstanding + p.outstanding,
            idle: w.idle + p.idle,
            elements: w.elements + p.elements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::backend::HostDevice;

    #[test]
    fn released_buffers_are_reused() {
        let dev = HostDevice::<f64>::new();
        let pool = MemoryPool::new(&dev);
        {
            let a = pool.reserve_work(&dev, 10).unwrap();
            assert_eq!(a.len(), 10);
            assert_eq!(a.as_slice().len(), 16);
            assert_eq!(pool.stats().outstanding, 1);
        }
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.stats().idle, 1);

        let _b = pool.reserve_work(&dev, 12).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn concurrent_reservations_do_not_alias() {
        let dev = HostDevice::<f64>::new();
        let pool = MemoryPool::new(&dev);
        pool.ensure_work(&dev, &[(8, 3)]).unwrap();
        let mut a = pool.reserve_work(&dev, 8).unwrap();
        let mut b = pool.reserve_work(&dev, 8).unwrap();
        let c = pool.reserve_work(&dev, 8).unwrap();
        a[0] = 1.0;
        b[0] = 2.0;
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_ne!(b.as_ptr(), c.as_ptr());
        assert_eq!(a[0], 1.0);
        assert_eq!(pool.stats().misses, 3);
        assert_eq!(pool.stats().hits, 3);
    }

    #[test]
    fn ensure_tops_up_only_missing_buffers() {
        let dev = HostDevice::<f64, f32>::new();
        let pool = MemoryPool::new(&dev);
        pool.ensure_precon(&dev, &[(100, 2)]).unwrap();
        pool.ensure_precon(&dev, &[(97, 1), (100, 1)]).unwrap();
        assert_eq!(pool.stats().misses, 2);
        let r = pool.reserve_precon(&dev, 100).unwrap();
        assert_eq!(r.as_slice().len(), 112);
        drop(r);
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.elements, 224);
    }

    #[test]
    fn contents_survive_release() {
        let dev = HostDevice::<f64>::new();
        let pool = MemoryPool::new(&dev);
        {
            let mut a = pool.reserve_work(&dev, 4).unwrap();
            a[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        }
        let a = pool.reserve_work(&dev, 4).unwrap();
        assert_eq!(&a[..4], &[1.0, 2.0, 3.0, 4.0]);
    }
}
