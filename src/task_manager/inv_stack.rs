use crate::config::MAX_SERVICE_DEPTH;
use crate::object::{MpdRef, SpdId};

/// One cross-domain call in progress. Frame 0 is the thread's origin.
#[derive(Debug)]
pub struct InvFrame {
    /// Domain the thread entered.
    pub spd: SpdId,
    /// Composite active at entry, held until the frame is popped.
    pub mpd: MpdRef,
    /// Where the caller resumes.
    pub sp: usize,
    pub ip: usize,
}

impl InvFrame {
    pub fn origin(spd: SpdId, mpd: MpdRef) -> Self {
        Self { spd, mpd, sp: 0, ip: 0 }
    }
}

pub struct InvocationStack {
    frames: [Option<InvFrame>; MAX_SERVICE_DEPTH],
    len: usize,
}

impl InvocationStack {
    pub fn new() -> Self {
        Self { frames: core::array::from_fn(|_| None), len: 0 }
    }

    /// Number of frames, origin included.
    #[inline]
    pub fn depth(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == MAX_SERVICE_DEPTH
    }

    /// Hands the frame back when the stack is full.
    pub fn push(&mut self, frame: InvFrame) -> Result<(), InvFrame> {
        if self.is_full() {
            return Err(frame);
        }
        self.frames[self.len] = Some(frame);
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<InvFrame> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        let frame = self.frames[self.len].take();
        assert!(frame.is_some(), "hole in invocation stack at {}", self.len);
        frame
    }

    /// Starts the stack over at `frame`. Frames still present must have
    /// been drained by the caller, which owns their references.
    pub fn set_origin(&mut self, frame: InvFrame) {
        assert!(self.is_empty(), "origin set on a stack of depth {}", self.len);
        self.frames[0] = Some(frame);
        self.len = 1;
    }

    #[inline]
    pub fn top(&self) -> Option<&InvFrame> {
        self.len.checked_sub(1).and_then(|i| self.frame(i))
    }

    #[inline]
    pub fn frame(&self, i: usize) -> Option<&InvFrame> {
        if i >= self.len {
            return None;
        }
        self.frames[i].as_ref()
    }

    /// Frames from the origin up.
    pub fn iter(&self) -> impl Iterator<Item = &InvFrame> + '_ {
        self.frames[..self.len].iter().flatten()
    }

    /// Offset of the most recent frame in `spd`.
    pub fn find_spd(&self, spd: SpdId) -> Option<usize> {
        (0..self.len).rev().find(|i| self.frames[*i].as_ref().map(|f| f.spd) == Some(spd))
    }
}

impl Default for InvocationStack {
    fn default() -> Self {
        Self::new()
    }
}
