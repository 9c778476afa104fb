// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-population frame buffer pool.

use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use log::trace;
use sync::Mutex;
use thiserror::Error;

use crate::frame::Frame;
use crate::handle::FrameHandle;
use crate::queue::FrameQueue;
use crate::FrameLayout;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Both the free and the freeable queue are empty: every frame is
    /// pinned by a live reference. The pool was sized too small for the
    /// reference structure of the stream; decode of the stream cannot
    /// continue.
    #[error("out of frames: all {0} frames in the pool are referenced")]
    OutOfFrames(usize),
}

/// Which frames may be handed out, under one mutex.
///
/// A frame is in `free`, in `freeable`, or in neither (bound to a handle as
/// Locked or Rendered). Queue membership changes and the frame state
/// transitions that accompany them happen under a single hold of this
/// mutex, so no one can observe a frame enqueued under the wrong state.
struct PoolInner {
    free: FrameQueue,
    freeable: FrameQueue,
}

/// Owns the frame population and arbitrates allocation.
///
/// All buffers are allocated up front; allocation never allocates, it only
/// recycles. Frames released after rendering go to the tail of the freeable
/// queue and are reclaimed head-first, so the picture released longest ago
/// is evicted first and recently released pictures stay resurrectable the
/// longest.
pub struct BufferPool {
    frames: Box<[Frame]>,
    layout: FrameLayout,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Creates a pool of `num_frames` buffers for pictures of
    /// `mb_width` x `mb_height` macroblocks, every buffer free.
    ///
    /// `num_frames` must cover the worst-case number of simultaneously
    /// referenced pictures: two prediction anchors plus decode lookahead
    /// plus the display pipeline depth. Undersizing surfaces later as
    /// [`Error::OutOfFrames`].
    pub fn new(num_frames: usize, mb_width: usize, mb_height: usize) -> Arc<BufferPool> {
        assert!(num_frames > 0, "a pool needs at least one frame");
        let layout = FrameLayout::new(mb_width, mb_height);
        let frames: Box<[Frame]> = (0..num_frames).map(|i| Frame::new(i, layout)).collect();
        let mut free = FrameQueue::new(num_frames);
        for index in 0..num_frames {
            free.push(index);
        }
        Arc::new(BufferPool {
            frames,
            layout,
            inner: Mutex::new(PoolInner {
                free,
                freeable: FrameQueue::new(num_frames),
            }),
        })
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_free(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn num_freeable(&self) -> usize {
        self.inner.lock().freeable.len()
    }

    pub(crate) fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    #[cfg(test)]
    pub(crate) fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Hands out a free frame, evicting the oldest freeable frame if the
    /// free queue is dry.
    ///
    /// On eviction the previous binding's handle is returned alongside the
    /// frame index; the caller must deliver the detach notification to it
    /// after releasing the pool mutex (delivering it from here, under the
    /// pool and frame mutexes, could deadlock against that handle
    /// resurrecting concurrently).
    pub(crate) fn get_free_frame(&self) -> Result<(usize, Option<Weak<FrameHandle>>)> {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.free.pop() {
            trace!("pool: frame {} from free queue", index);
            return Ok((index, None));
        }
        let index = match inner.freeable.pop() {
            Some(index) => index,
            None => return Err(Error::OutOfFrames(self.frames.len())),
        };
        let evicted = self.frames[index].free();
        debug!("pool: evicted frame {}", index);
        Ok((index, evicted))
    }

    /// Queues a rendered frame whose last reference was just dropped. The
    /// binding survives so the handle can resurrect it until eviction.
    pub(crate) fn make_freeable(&self, index: usize) {
        let mut inner = self.inner.lock();
        inner.freeable.push(index);
        self.frames[index].set_freeable();
    }

    /// Queues a frame whose decode was abandoned before completion. The
    /// pixels are garbage, so it goes straight back to the free queue.
    pub(crate) fn make_free(&self, index: usize) {
        let mut inner = self.inner.lock();
        inner.free.push(index);
        self.frames[index].free_locked();
    }

    /// Splices `index` out of the freeable queue and relocks it for
    /// `handle`, provided it is still bound to `handle`. Returns whether
    /// the rescue won the race with eviction.
    pub(crate) fn try_resurrect(&self, index: usize, handle: &FrameHandle) -> bool {
        let mut inner = self.inner.lock();
        if !self.frames[index].relock_if_bound(handle) {
            return false;
        }
        inner.freeable.unlink(index);
        true
    }
}
