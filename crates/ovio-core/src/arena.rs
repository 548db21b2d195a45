//! Generation-checked slot arena
//!
//! Stores values behind [`Token`]s. Freed slots are reused LIFO and their
//! generation is bumped, so stale tokens resolve to `None` instead of to
//! whatever moved into the slot later.
//!
//! The arena itself is not synchronized; owners wrap it in a mutex.

use crate::error::{OvioError, Result};
use crate::token::Token;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    /// LIFO stack of free slot indices
    free: Vec<u32>,
    len: usize,
    max: usize,
}

impl<T> Arena<T> {
    /// Create an arena holding at most `max` live entries.
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            max: max.min(u32::MAX as usize - 1),
        }
    }

    pub fn insert(&mut self, value: T) -> Result<Token> {
        if self.len >= self.max {
            return Err(OvioError::Capacity(format!("arena full ({} entries)", self.max)));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, value: None });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.value = Some(value);
        self.len += 1;
        Ok(Token::new(index, slot.generation))
    }

    #[inline]
    fn slot(&self, token: Token) -> Option<&Slot<T>> {
        self.slots
            .get(token.index() as usize)
            .filter(|s| s.generation == token.generation() && s.value.is_some())
    }

    pub fn get(&self, token: Token) -> Option<&T> {
        self.slot(token).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.slots
            .get_mut(token.index() as usize)
            .filter(|s| s.generation == token.generation())
            .and_then(|s| s.value.as_mut())
    }

    #[inline]
    pub fn contains(&self, token: Token) -> bool {
        self.slot(token).is_some()
    }

    /// Remove the entry; the slot becomes reusable under a new generation.
    pub fn remove(&mut self, token: Token) -> Option<T> {
        let slot = self.slots.get_mut(token.index() as usize)?;
        if slot.generation != token.generation() {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(token.index());
        self.len -= 1;
        Some(value)
    }

    /// Remove every entry, returning them in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                self.free.push(index as u32);
                out.push(value);
            }
        }
        self.len = 0;
        out
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
    pub fn capacity(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new(8);
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stale_token_after_reuse() {
        let mut arena = Arena::new(8);
        let old = arena.insert(1).unwrap();
        arena.remove(old);

        // LIFO reuse hands out the same slot under a new generation
        let new = arena.insert(2).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.get(new), Some(&2));
        assert!(arena.get_mut(old).is_none());
    }

    #[test]
    fn test_capacity() {
        let mut arena = Arena::new(2);
        arena.insert(()).unwrap();
        arena.insert(()).unwrap();
        assert!(matches!(arena.insert(()), Err(OvioError::Capacity(_))));
    }

    #[test]
    fn test_drain() {
        let mut arena = Arena::new(4);
        let t = arena.insert(10).unwrap();
        arena.insert(20).unwrap();
        assert_eq!(arena.drain(), vec![10, 20]);
        assert!(arena.is_empty());
        assert!(!arena.contains(t));
    }

    #[test]
    fn test_none_token_never_resolves() {
        let mut arena = Arena::new(4);
        arena.insert(1).unwrap();
        assert!(arena.get(Token::NONE).is_none());
    }
}
