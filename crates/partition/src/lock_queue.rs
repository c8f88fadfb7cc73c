//! FIFO queue of blocked lock requests
//!
//! One queue exists per contended row or index key. Waiters are only ever
//! granted from the front, so two waiters on the same key are granted in
//! the order they arrived.

use infini_common::{SubtransactionId, TransactionId};
use infini_protocol::ReplyTag;
use std::collections::VecDeque;

/// Who asked for a lock and how to answer them once it is granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub subtransaction: SubtransactionId,
    pub transaction: TransactionId,
    pub tag: ReplyTag,
}

#[derive(Debug, Clone)]
pub struct LockQueue<W> {
    waiters: VecDeque<W>,
}

impl<W> Default for LockQueue<W> {
    fn default() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }
}

impl<W> LockQueue<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, waiter: W) {
        self.waiters.push_back(waiter);
    }

    pub fn front(&self) -> Option<&W> {
        self.waiters.front()
    }

    pub fn pop(&mut self) -> Option<W> {
        self.waiters.pop_front()
    }

    /// Remove every waiter matching `pred`, keeping the others in order
    pub fn remove_where(&mut self, mut pred: impl FnMut(&W) -> bool) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|w| !pred(w));
        before - self.waiters.len()
    }

    /// First waiter matching `pred`, left in its place
    pub fn find_mut(&mut self, mut pred: impl FnMut(&W) -> bool) -> Option<&mut W> {
        self.waiters.iter_mut().find(|w| pred(&**w))
    }

    /// Take every waiter, oldest first
    pub fn drain(&mut self) -> Vec<W> {
        self.waiters.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &W> {
        self.waiters.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = LockQueue::new();
        queue.push("w1");
        queue.push("w2");
        queue.push("w3");

        assert_eq!(queue.front(), Some(&"w1"));
        assert_eq!(queue.pop(), Some("w1"));
        assert_eq!(queue.pop(), Some("w2"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut queue = LockQueue::new();
        for i in 1..=5 {
            queue.push(i);
        }

        assert_eq!(queue.remove_where(|w| w % 2 == 0), 2);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5]);
        if let Some(w) = queue.find_mut(|w| *w == 3) {
            *w = 4;
        }
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![1, 4, 5]);
        assert!(queue.find_mut(|w| *w == 3).is_none());
        assert_eq!(queue.drain(), vec![1, 4, 5]);
        assert!(queue.is_empty());
    }
}
