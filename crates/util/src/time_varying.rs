//! A value that changes at known points in time.
//!
//! [TimeVarying] stores the value in effect before any change plus an ordered list of
//! breakpoints. Writers may only append at or after the latest breakpoint.

use std::collections::VecDeque;

use crate::time::TIME_MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    #[error("time {time} is before the last recorded change at {last}")]
    OutOfOrder { time: i64, last: i64 },
}

#[derive(Clone, Debug)]
pub struct TimeVarying<T> {
    current: T,
    changes: VecDeque<(i64, T)>,
}

impl<T: Clone + PartialEq> TimeVarying<T> {
    pub fn new(initial: T) -> Self {
        Self {
            current: initial,
            changes: VecDeque::new(),
        }
    }

    /// The value in effect at `time`.
    pub fn get(&self, time: i64) -> T {
        self.get_with_end(time).0
    }

    /// The value in effect at `time`, and the time of the next change ([TIME_MAX] if none).
    pub fn get_with_end(&self, time: i64) -> (T, i64) {
        let index = self.changes.partition_point(|(t, _)| *t <= time);
        let end = self.changes.get(index).map_or(TIME_MAX, |(t, _)| *t);
        let value = match index {
            0 => self.current.clone(),
            n => self.changes[n - 1].1.clone(),
        };
        (value, end)
    }

    /// The value in effect just before `time`.
    pub fn get_before(&self, time: i64) -> T {
        let index = self.changes.partition_point(|(t, _)| *t < time);
        match index {
            0 => self.current.clone(),
            n => self.changes[n - 1].1.clone(),
        }
    }

    /// The value that will be in effect forever, barring further changes.
    pub fn last(&self) -> &T {
        self.changes.back().map_or(&self.current, |(_, value)| value)
    }

    /// Make `value` effective from `time` onwards.
    ///
    /// Appending at the time of the last change replaces it. Appending before it is an error.
    pub fn set_from(&mut self, time: i64, value: T) -> Result<(), TimeError> {
        if let Some((last, _)) = self.changes.back() {
            if time < *last {
                return Err(TimeError::OutOfOrder { time, last: *last });
            }
            if time == *last {
                self.changes.pop_back();
            }
        }
        if *self.last() != value {
            self.changes.push_back((time, value));
        }
        Ok(())
    }

    /// Forget every change at or before `time`; the value at `time` becomes the floor.
    pub fn advance_current_time(&mut self, time: i64) {
        while self.changes.front().is_some_and(|(t, _)| *t <= time) {
            if let Some((_, value)) = self.changes.pop_front() {
                self.current = value;
            }
        }
    }

    /// Number of recorded changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> impl Iterator<Item = (i64, &T)> + '_ {
        self.changes.iter().map(|(t, value)| (*t, value))
    }
}

impl<T: Clone + PartialEq + Default> Default for TimeVarying<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
