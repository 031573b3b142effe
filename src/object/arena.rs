//! Fixed-capacity object pools addressed by generation-checked handles.
//!
//! Freeing a slot bumps its generation, so a handle kept past the object's
//! lifetime fails every lookup instead of aliasing the slot's next occupant.

use core::fmt;
use core::marker::PhantomData;

pub struct Handle<T> {
    idx: u16,
    gen: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    #[inline]
    fn new(idx: usize, gen: u16) -> Self {
        Self { idx: idx as u16, gen, _marker: PhantomData }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.idx as usize
    }

    #[inline]
    pub fn generation(&self) -> u16 {
        self.gen
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx && self.gen == other.gen
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.idx, self.gen)
    }
}

struct Slot<T> {
    gen: u16,
    value: Option<T>,
}

pub struct Arena<T, const N: usize> {
    slots: [Slot<T>; N],
    live: usize,
}

impl<T, const N: usize> Arena<T, N> {
    pub const fn new() -> Self {
        Self {
            slots: [const { Slot { gen: 0, value: None } }; N],
            live: 0,
        }
    }

    /// Places the value built by `f` in the lowest free slot. `f` receives
    /// the handle the object will be known by.
    pub fn alloc_with<F: FnOnce(Handle<T>) -> T>(&mut self, f: F) -> Option<Handle<T>> {
        let idx = self.slots.iter().position(|s| s.value.is_none())?;
        let handle = Handle::new(idx, self.slots[idx].gen);
        self.slots[idx].value = Some(f(handle));
        self.live += 1;
        Some(handle)
    }

    pub fn alloc(&mut self, value: T) -> Option<Handle<T>> {
        self.alloc_with(|_| value)
    }

    pub fn free(&mut self, h: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(h.index())?;
        if slot.gen != h.gen || slot.value.is_none() {
            return None;
        }
        slot.gen = slot.gen.wrapping_add(1);
        self.live -= 1;
        slot.value.take()
    }

    #[inline]
    pub fn get(&self, h: Handle<T>) -> Option<&T> {
        match self.slots.get(h.index()) {
            Some(slot) if slot.gen == h.gen => slot.value.as_ref(),
            _ => None,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, h: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(h.index()) {
            Some(slot) if slot.gen == h.gen => slot.value.as_mut(),
            _ => None,
        }
    }

    /// Mutable access to two distinct live objects at once.
    pub fn get2_mut(&mut self, a: Handle<T>, b: Handle<T>) -> Option<(&mut T, &mut T)> {
        if a.index() == b.index() || a.index() >= N || b.index() >= N {
            return None;
        }
        let (lo, hi, swapped) = if a.index() < b.index() { (a, b, false) } else { (b, a, true) };
        let (left, right) = self.slots.split_at_mut(hi.index());
        let lo_slot = &mut left[lo.index()];
        let hi_slot = &mut right[0];
        if lo_slot.gen != lo.gen || hi_slot.gen != hi.gen {
            return None;
        }
        let (x, y) = (lo_slot.value.as_mut()?, hi_slot.value.as_mut()?);
        if swapped {
            Some((y, x))
        } else {
            Some((x, y))
        }
    }

    /// Handle of the object currently living in slot `idx`.
    #[inline]
    pub fn handle_at(&self, idx: usize) -> Option<Handle<T>> {
        let slot = self.slots.get(idx)?;
        slot.value.as_ref().map(|_| Handle::new(idx, slot.gen))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.live == N
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.value.as_ref().map(|v| (Handle::new(i, s.gen), v)))
    }
}

impl<T, const N: usize> Default for Arena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_misses_after_reuse() {
        let mut a: Arena<u32, 2> = Arena::new();
        let h = a.alloc(7).unwrap();
        assert_eq!(a.free(h), Some(7));
        let h2 = a.alloc(9).unwrap();
        assert_eq!(h.index(), h2.index());
        assert!(a.get(h).is_none());
        assert_eq!(a.get(h2), Some(&9));
        assert!(a.free(h).is_none());
    }

    #[test]
    fn exhaustion_and_pair_access() {
        let mut a: Arena<u32, 2> = Arena::new();
        let x = a.alloc(1).unwrap();
        let y = a.alloc(2).unwrap();
        assert!(a.alloc(3).is_none());
        assert!(a.is_full());
        let (vy, vx) = a.get2_mut(y, x).unwrap();
        *vx += 10;
        *vy += 20;
        assert_eq!(a.get(x), Some(&11));
        assert_eq!(a.get(y), Some(&22));
        assert!(a.get2_mut(x, x).is_none());
    }
}
