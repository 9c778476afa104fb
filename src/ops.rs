// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Operation queue driving the decoder control loop.
//!
//! Control, display, and input threads do not poke the decoder directly;
//! they enqueue operations that the decoder thread executes against its
//! state between frames. Per-frame work queues up at pace, so urgent
//! operations (a shutdown, a mode toggle) can leapfrog the queued backlog
//! instead of waiting behind it.

use std::collections::VecDeque;

use sync::Condvar;
use sync::Mutex;

/// State owned by the decoder control loop.
pub struct DecoderState {
    /// Cleared by [`Shutdown`]; threads check it between frames and wind
    /// down cooperatively. All handle references must be dropped before the
    /// pool is torn down.
    pub live: bool,
    /// Index of the picture the display is parked on.
    pub current_picture: i64,
}

impl DecoderState {
    pub fn new() -> DecoderState {
        DecoderState {
            live: true,
            current_picture: 0,
        }
    }
}

impl Default for DecoderState {
    fn default() -> Self {
        DecoderState::new()
    }
}

/// Coarse classification used for leapfrog targeting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Paced per-frame work; a backlog of these may be overtaken.
    Frame,
    /// Control operations; never overtaken.
    Control,
}

/// One deferred operation against the decoder state.
pub trait DecoderOp: Send {
    fn kind(&self) -> OpKind {
        OpKind::Control
    }

    fn execute(self: Box<Self>, state: &mut DecoderState);
}

/// Stops the pipeline.
pub struct Shutdown;

impl DecoderOp for Shutdown {
    fn execute(self: Box<Self>, state: &mut DecoderState) {
        state.live = false;
    }
}

/// Moves the display cursor by `delta` pictures (negative steps backward).
pub struct StepPicture(pub i64);

impl DecoderOp for StepPicture {
    fn execute(self: Box<Self>, state: &mut DecoderState) {
        state.current_picture += self.0;
    }
}

/// FIFO of pending operations with blocking dequeue.
pub struct OpQueue {
    pending: Mutex<VecDeque<Box<dyn DecoderOp>>>,
    activity: Condvar,
}

impl OpQueue {
    pub fn new() -> OpQueue {
        OpQueue {
            pending: Mutex::new(VecDeque::new()),
            activity: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Appends `op` at the tail.
    pub fn enqueue(&self, op: Box<dyn DecoderOp>) {
        self.pending.lock().push_back(op);
        self.activity.notify_one();
    }

    /// Enqueues `op` ahead of the trailing run of queued operations of kind
    /// `overtaken`, so it executes before that backlog. Operations of other
    /// kinds keep their position.
    pub fn leapfrog_enqueue(&self, op: Box<dyn DecoderOp>, overtaken: OpKind) {
        let mut pending = self.pending.lock();
        let mut at = pending.len();
        while at > 0 && pending[at - 1].kind() == overtaken {
            at -= 1;
        }
        pending.insert(at, op);
        self.activity.notify_one();
    }

    /// Pops the head, blocking until an operation is available.
    pub fn dequeue(&self) -> Box<dyn DecoderOp> {
        let mut pending = self.pending.lock();
        loop {
            match pending.pop_front() {
                Some(op) => return op,
                None => pending = self.activity.wait(pending),
            }
        }
    }

    /// Pops the head, or returns `None` when nothing is queued.
    pub fn try_dequeue(&self) -> Option<Box<dyn DecoderOp>> {
        self.pending.lock().pop_front()
    }
}

impl Default for OpQueue {
    fn default() -> Self {
        OpQueue::new()
    }
}
