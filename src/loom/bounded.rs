//! Fixed-capacity vector used for residency records and task operands.
//!
//! Storage is inline; pushing past capacity is an error rather than a reallocation.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("capacity of {0} exceeded")]
pub struct CapacityError(pub usize);

#[derive(Debug, Clone)]
pub struct Bounded<T, const N: usize> {
    items: [Option<T>; N],
    len: usize,
}

impl<T, const N: usize> Default for Bounded<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Bounded<T, N> {
    pub fn new() -> Self {
        Self {
            items: std::array::from_fn(|_| None),
            len: 0,
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    pub fn push(&mut self, item: T) -> Result<(), CapacityError> {
        if self.len == N {
            return Err(CapacityError(N));
        }
        self.items[self.len] = Some(item);
        self.len += 1;
        Ok(())
    }

    /// Removes the item at `index`, shifting later items down to keep the order.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        let item = self.items[index].take();
        self.items[index..self.len].rotate_left(1);
        self.len -= 1;
        item
    }

    /// Keeps only the items for which `f` returns `true`, returning the removed ones.
    pub fn extract_if(&mut self, mut f: impl FnMut(&mut T) -> bool) -> Vec<T> {
        let mut removed = vec![];
        let mut index = 0;
        while index < self.len {
            let hit = self.items[index].as_mut().is_some_and(&mut f);
            match hit {
                true => removed.extend(self.remove(index)),
                false => index += 1,
            }
        }
        removed
    }

    pub fn clear(&mut self) -> Vec<T> {
        let len = self.len;
        self.len = 0;
        self.items[..len].iter_mut().filter_map(Option::take).collect()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items[..self.len].iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items[..self.len].iter_mut().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::{Bounded, CapacityError};

    #[test]
    fn test_capacity() {
        let mut items = Bounded::<u32, 3>::new();
        items.push(1).unwrap();
        items.push(2).unwrap();
        items.push(3).unwrap();
        assert!(items.is_full());
        assert_eq!(items.push(4), Err(CapacityError(3)));
        assert_eq!(items.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut items = Bounded::<u32, 4>::new();
        (0..4).for_each(|x| items.push(x).unwrap());
        assert_eq!(items.remove(1), Some(1));
        assert_eq!(items.remove(7), None);
        assert_eq!(items.iter().copied().collect::<Vec<_>>(), vec![0, 2, 3]);

        let removed = items.extract_if(|x| *x >= 2);
        assert_eq!(removed, vec![2, 3]);
        assert_eq!(items.len(), 1);
        assert_eq!(items.clear(), vec![0]);
        assert!(items.is_empty());
    }
}
