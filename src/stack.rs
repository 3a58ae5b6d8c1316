// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The unpickler's operand stack with mark bookkeeping.

use crate::error::ErrorCode;
use crate::value::{Heap, Value};

/// Growable value stack plus an auxiliary stack of MARK positions.
///
/// `fence` is the position of the innermost open mark (or 0); no pop may
/// take the stack below it.
#[derive(Debug, Default)]
pub struct OperandStack {
    items: Vec<Value>,
    marks: Vec<usize>,
    fence: usize,
    mark_present: bool,
}

impl OperandStack {
    pub fn new() -> OperandStack {
        OperandStack {
            items: Vec::with_capacity(128),
            marks: Vec::with_capacity(16),
            fence: 0,
            mark_present: false,
        }
    }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn fence(&self) -> usize { self.fence }

    pub fn mark_present(&self) -> bool { self.mark_present }

    /// The error for a pop that would cross the fence.
    pub fn underflow(&self) -> ErrorCode {
        if self.mark_present { ErrorCode::UnexpectedMark } else { ErrorCode::StackUnderflow }
    }

    pub fn push(&mut self, value: Value) {
        self.items.push(value);
    }

    pub fn pop(&mut self) -> Result<Value, ErrorCode> {
        if self.items.len() <= self.fence {
            return Err(self.underflow());
        }
        self.items.pop().ok_or(ErrorCode::StackUnderflow)
    }

    pub fn top(&self) -> Result<&Value, ErrorCode> {
        if self.items.len() <= self.fence {
            return Err(self.underflow());
        }
        self.items.last().ok_or(ErrorCode::StackUnderflow)
    }

    /// Replaces the topmost value.
    pub fn set_top(&mut self, value: Value) -> Result<(), ErrorCode> {
        if self.items.len() <= self.fence {
            return Err(self.underflow());
        }
        match self.items.last_mut() {
            Some(top) => { *top = value; Ok(()) }
            None => Err(ErrorCode::StackUnderflow),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    /// Opens a mark at the current stack size.
    pub fn mark(&mut self) {
        let len = self.items.len();
        self.marks.push(len);
        self.fence = len;
        self.mark_present = true;
    }

    /// Closes the innermost mark and returns its position.
    pub fn pop_mark(&mut self) -> Result<usize, ErrorCode> {
        let mark = self.marks.pop().ok_or(ErrorCode::MarkNotFound)?;
        self.restore_fence();
        Ok(mark)
    }

    /// Closes the innermost mark if it sits exactly at the stack top.
    pub fn pop_mark_at_top(&mut self) -> bool {
        if self.marks.last() == Some(&self.items.len()) {
            self.marks.pop();
            self.restore_fence();
            true
        } else {
            false
        }
    }

    fn restore_fence(&mut self) {
        self.fence = self.marks.last().copied().unwrap_or(0);
        self.mark_present = !self.marks.is_empty();
    }

    /// Removes and returns the values from `start` to the top.
    pub fn drain_from(&mut self, start: usize) -> Result<Vec<Value>, ErrorCode> {
        if start > self.items.len() || start < self.fence {
            return Err(self.underflow());
        }
        Ok(self.items.split_off(start))
    }

    /// Replaces the values from `start` to the top with a tuple of them.
    pub fn pop_tuple(&mut self, heap: &mut Heap, start: usize) -> Result<(), ErrorCode> {
        let items = self.drain_from(start)?;
        let tuple = heap.tuple(items);
        self.items.push(tuple);
        Ok(())
    }

    /// Replaces the values from `start` to the top with a list of them.
    pub fn pop_list(&mut self, heap: &mut Heap, start: usize) -> Result<(), ErrorCode> {
        let items = self.drain_from(start)?;
        let list = heap.list(items);
        self.items.push(list);
        Ok(())
    }

    /// Drops every value above position `n`.
    pub fn clear_to(&mut self, n: usize) {
        self.items.truncate(n);
    }

    /// Empties the stack and forgets all marks.
    pub fn clear(&mut self) {
        self.items.clear();
        self.marks.clear();
        self.fence = 0;
        self.mark_present = false;
    }
}
