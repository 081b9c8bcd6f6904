//! Pairs merger: aligns two index-sorted entry streams.
//!
//! Both sides are lazy, finite, fallible iterators sorted by entry
//! index. Each step peeks both heads and yields `(left, right)` where a
//! side is present iff its head carries the smaller (or equal) index.
//! Errors from either side are yielded immediately and end the stream.

use std::iter::Peekable;

use super::entry::LogEntry;
use crate::error::Result;

/// Iterator over aligned `(incoming, existing)` entry pairs.
pub struct Pairs<L, R>
where
    L: Iterator<Item = Result<LogEntry>>,
    R: Iterator<Item = Result<LogEntry>>,
{
    left: Peekable<L>,
    right: Peekable<R>,
    done: bool,
}

impl<L, R> Pairs<L, R>
where
    L: Iterator<Item = Result<LogEntry>>,
    R: Iterator<Item = Result<LogEntry>>,
{
    pub fn new(left: L, right: R) -> Self {
        Pairs {
            left: left.peekable(),
            right: right.peekable(),
            done: false,
        }
    }
}

impl<L, R> Iterator for Pairs<L, R>
where
    L: Iterator<Item = Result<LogEntry>>,
    R: Iterator<Item = Result<LogEntry>>,
{
    type Item = Result<(Option<LogEntry>, Option<LogEntry>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // Surface an error from either head before comparing indexes.
        if matches!(self.left.peek(), Some(Err(_))) {
            self.done = true;
            let err = self.left.next()?.unwrap_err();
            return Some(Err(err));
        }
        if matches!(self.right.peek(), Some(Err(_))) {
            self.done = true;
            let err = self.right.next()?.unwrap_err();
            return Some(Err(err));
        }

        let left_index = match self.left.peek() {
            Some(Ok(e)) => Some(e.index),
            _ => None,
        };
        let right_index = match self.right.peek() {
            Some(Ok(e)) => Some(e.index),
            _ => None,
        };

        let take_left;
        let take_right;
        match (left_index, right_index) {
            (None, None) => {
                self.done = true;
                return None;
            }
            (Some(l), Some(r)) => {
                take_left = l <= r;
                take_right = r <= l;
            }
            (Some(_), None) => {
                take_left = true;
                take_right = false;
            }
            (None, Some(_)) => {
                take_left = false;
                take_right = true;
            }
        }

        let left = if take_left {
            self.left.next().and_then(|e| e.ok())
        } else {
            None
        };
        let right = if take_right {
            self.right.next().and_then(|e| e.ok())
        } else {
            None
        };
        Some(Ok((left, right)))
    }
}
