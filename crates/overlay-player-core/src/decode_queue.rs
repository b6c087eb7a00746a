//! Bounded queue of decoded units with a flush generation counter.
//!
//! The queue itself is not synchronized: each pipeline keeps it inside the
//! pipeline mutex, and every mutation happens with that mutex held. Only the
//! [`QueueSerial`] is shared outside the lock, so clocks can check staleness
//! without taking it.
//!
//! # Shown picture
//!
//! A queue created with `keep_last` retains the most recently presented unit
//! after [`DecodeQueue::advance`], so a renderer can redraw it until the next
//! one replaces it. The first advance only marks the head as shown; every
//! later advance pops the previously shown unit. A flush keeps the shown
//! unit too, so there is something to redraw until the first unit of the new
//! serial is presented.

use std::collections::VecDeque;

use crate::clock::QueueSerial;

/// Serial a freshly created queue starts at. Clocks start at serial 0, so a
/// new clock is stale until it observes a unit from the queue.
pub const INITIAL_SERIAL: u64 = 1;

/// A bounded FIFO of decoded units in presentation order.
pub struct DecodeQueue<T> {
    units: VecDeque<T>,
    capacity: usize,
    serial: QueueSerial,
    keep_last: bool,
    /// True once the head unit has been presented and is retained for redraw
    shown: bool,
}

impl<T> DecodeQueue<T> {
    /// Creates a queue holding at most `capacity` units.
    pub fn new(capacity: usize, keep_last: bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            units: VecDeque::with_capacity(capacity),
            capacity,
            serial: QueueSerial::new(INITIAL_SERIAL),
            keep_last,
            shown: false,
        }
    }

    /// Appends a unit, handing it back if the queue is full.
    pub fn push(&mut self, unit: T) -> Result<(), T> {
        if self.units.len() >= self.capacity {
            return Err(unit);
        }
        self.units.push_back(unit);
        Ok(())
    }

    /// Removes the oldest unit.
    pub fn pop_front(&mut self) -> Option<T> {
        let unit = self.units.pop_front();
        if unit.is_some() {
            self.shown = false;
        }
        unit
    }

    /// Non-owning lookup by position from the oldest unit.
    pub fn peek(&self, index: usize) -> Option<&T> {
        self.units.get(index)
    }

    /// The next unit to present.
    pub fn peek_current(&self) -> Option<&T> {
        self.units.get(self.shown_offset())
    }

    /// The unit after [`peek_current`](Self::peek_current).
    pub fn peek_next(&self) -> Option<&T> {
        self.units.get(self.shown_offset() + 1)
    }

    /// The unit presented last (or the oldest one if nothing was presented yet).
    pub fn peek_last(&self) -> Option<&T> {
        self.units.front()
    }

    /// Marks the current unit as presented.
    ///
    /// With `keep_last` the first call only flags the head as shown;
    /// afterwards each call retires the previously shown unit.
    /// Returns the retired unit, if any.
    pub fn advance(&mut self) -> Option<T> {
        if self.keep_last && !self.shown {
            if !self.units.is_empty() {
                self.shown = true;
            }
            return None;
        }
        let retired = self.units.pop_front();
        if self.keep_last && !self.units.is_empty() {
            self.shown = true;
        } else {
            self.shown = false;
        }
        retired
    }

    /// Drops every unit except the shown one and bumps the serial.
    ///
    /// Returns the number of units dropped.
    pub fn flush(&mut self) -> usize {
        let kept = if self.shown { self.units.pop_front() } else { None };
        let dropped = self.units.len();
        self.units.clear();
        match kept {
            Some(unit) => self.units.push_back(unit),
            None => self.shown = false,
        }
        let serial = self.serial.bump();
        tracing::debug!("DecodeQueue::flush: dropped {} units, serial now {}", dropped, serial);
        dropped
    }

    /// Number of units not yet presented.
    pub fn remaining(&self) -> usize {
        self.units.len() - self.shown_offset()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.units.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_shown(&self) -> bool {
        self.shown
    }

    /// The unit retained for redraw, if one was presented.
    pub fn shown_unit(&self) -> Option<&T> {
        if self.shown {
            self.units.front()
        } else {
            None
        }
    }

    /// Current serial value.
    pub fn serial(&self) -> u64 {
        self.serial.get()
    }

    /// Shared handle to the serial, for binding clocks.
    pub fn serial_ref(&self) -> QueueSerial {
        self.serial.clone()
    }

    /// Iterates the queued units, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.units.iter()
    }

    fn shown_offset(&self) -> usize {
        usize::from(self.shown && !self.units.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_queue_push_pop() {
        let mut queue = DecodeQueue::new(3, false);

        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert!(queue.push(3).is_ok());
        assert!(queue.is_full());
        assert_eq!(queue.push(4), Err(4));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop_front(), Some(1));
        assert!(!queue.is_full());
        assert_eq!(queue.peek(0), Some(&2));
    }

    #[test]
    fn test_decode_queue_pop_empty_is_none() {
        let mut queue: DecodeQueue<u32> = DecodeQueue::new(2, false);
        assert_eq!(queue.pop_front(), None);
        assert_eq!(queue.peek_current(), None);
        assert_eq!(queue.advance(), None);
    }

    #[test]
    fn test_decode_queue_flush_bumps_serial() {
        let mut queue = DecodeQueue::new(5, false);
        let serial = queue.serial_ref();
        assert_eq!(serial.get(), INITIAL_SERIAL);

        queue.push(10).ok();
        queue.push(11).ok();
        assert_eq!(queue.flush(), 2);
        assert!(queue.is_empty());
        assert_eq!(serial.get(), INITIAL_SERIAL + 1);

        for _ in 0..4 {
            queue.flush();
        }
        assert_eq!(queue.serial(), INITIAL_SERIAL + 5);
    }

    #[test]
    fn test_keep_last_advance() {
        let mut queue = DecodeQueue::new(4, true);
        queue.push('a').ok();
        queue.push('b').ok();
        queue.push('c').ok();

        assert_eq!(queue.peek_current(), Some(&'a'));
        assert_eq!(queue.peek_next(), Some(&'b'));
        assert_eq!(queue.remaining(), 3);

        // First advance keeps 'a' for redraw
        assert_eq!(queue.advance(), None);
        assert!(queue.is_shown());
        assert_eq!(queue.peek_last(), Some(&'a'));
        assert_eq!(queue.peek_current(), Some(&'b'));
        assert_eq!(queue.remaining(), 2);

        // Later advances retire the previously shown unit
        assert_eq!(queue.advance(), Some('a'));
        assert_eq!(queue.peek_last(), Some(&'b'));
        assert_eq!(queue.peek_current(), Some(&'c'));

        assert_eq!(queue.advance(), Some('b'));
        assert_eq!(queue.peek_last(), Some(&'c'));
        assert_eq!(queue.peek_current(), None);
        assert_eq!(queue.remaining(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_flush_retains_shown_unit() {
        let mut queue = DecodeQueue::new(3, true);
        queue.push(1).ok();
        queue.push(2).ok();
        queue.push(3).ok();
        queue.advance();
        assert_eq!(queue.shown_unit(), Some(&1));

        assert_eq!(queue.flush(), 2);
        assert!(queue.is_shown());
        assert_eq!(queue.shown_unit(), Some(&1));
        assert_eq!(queue.remaining(), 0);
        assert_eq!(queue.peek_current(), None);

        queue.push(7).ok();
        assert_eq!(queue.peek_current(), Some(&7));
        assert_eq!(queue.advance(), Some(1));
        assert_eq!(queue.shown_unit(), Some(&7));
    }

    #[test]
    fn test_flush_without_shown_unit_clears_all() {
        let mut queue = DecodeQueue::new(3, true);
        queue.push(1).ok();
        queue.push(2).ok();
        assert_eq!(queue.flush(), 2);
        assert!(queue.is_empty());
        assert!(!queue.is_shown());
        assert_eq!(queue.shown_unit(), None);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut queue = DecodeQueue::new(2, true);
        for i in 0..10 {
            let _ = queue.push(i);
            assert!(queue.len() <= queue.capacity());
            if i % 3 == 0 {
                queue.advance();
            }
        }
    }
}
