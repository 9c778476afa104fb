// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A single pooled frame buffer and its lifecycle state machine.

use std::alloc::alloc_zeroed;
use std::alloc::dealloc;
use std::alloc::handle_alloc_error;
use std::alloc::Layout;
use std::sync::Arc;
use std::sync::Weak;

use log::trace;
use sync::Condvar;
use sync::Mutex;

use crate::handle::FrameHandle;
use crate::picture::Picture;
use crate::volatile::VolatileSlice;
use crate::FrameLayout;

/// Lifecycle state of a frame buffer.
///
/// `Free` frames sit in the pool's free queue with no handle bound.
/// `Locked` frames are being rendered into. `Rendered` frames hold finished
/// pixels and at least one reference. `Freeable` frames hold finished pixels
/// but no references: the pool may reclaim them, and until it does their
/// handle may resurrect them without a redecode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameState {
    Free,
    Locked,
    Rendered,
    Freeable,
}

/// Decode context for one macroblock row.
///
/// Slice decoder workers pick their row's context up from here instead of
/// chasing the picture, so a row can be handed to a worker as one
/// self-contained unit.
#[derive(Clone, Default)]
pub struct SliceRow {
    f_code_fv: i32,
    f_code_bv: i32,
    forward: Option<Arc<FrameHandle>>,
    backward: Option<Arc<FrameHandle>>,
}

impl SliceRow {
    pub fn init(
        &mut self,
        f_code_fv: i32,
        f_code_bv: i32,
        forward: Option<Arc<FrameHandle>>,
        backward: Option<Arc<FrameHandle>>,
    ) {
        self.f_code_fv = f_code_fv;
        self.f_code_bv = f_code_bv;
        self.forward = forward;
        self.backward = backward;
    }

    fn clear(&mut self) {
        *self = SliceRow::default();
    }

    pub fn f_code_fv(&self) -> i32 {
        self.f_code_fv
    }

    pub fn f_code_bv(&self) -> i32 {
        self.f_code_bv
    }

    pub fn forward(&self) -> Option<Arc<FrameHandle>> {
        self.forward.clone()
    }

    pub fn backward(&self) -> Option<Arc<FrameHandle>> {
        self.backward.clone()
    }
}

/// The raw pixel allocation backing one frame.
///
/// This is deliberately not a `Box<[u8]>`: pixel memory is written and read
/// through [`VolatileSlice`] views while other views exist, so no Rust
/// reference to the bytes may ever be formed. The block is zeroed at
/// construction and freed on drop; frames never move, so views handed out
/// while the frame is alive stay valid.
struct FrameBuf {
    addr: *mut u8,
    layout: Layout,
}

// Safe because the allocation is reached only through volatile access, which
// stays defined under concurrent use from multiple threads.
unsafe impl Send for FrameBuf {}
unsafe impl Sync for FrameBuf {}

impl FrameBuf {
    fn new(len: usize) -> FrameBuf {
        let layout = match Layout::from_size_align(len, 1) {
            Ok(layout) => layout,
            Err(_) => panic!("frame buffer of {} bytes is unrepresentable", len),
        };
        // Safe because the layout has nonzero size; FrameLayout rejects
        // zero-macroblock dimensions.
        let addr = unsafe { alloc_zeroed(layout) };
        if addr.is_null() {
            handle_alloc_error(layout);
        }
        FrameBuf { addr, layout }
    }

    fn slice(&self) -> VolatileSlice {
        // Safe because the allocation lives as long as the returned view's
        // borrow of `self`, and all users go through volatile access.
        unsafe { VolatileSlice::new(self.addr, self.layout.size()) }
    }
}

impl Drop for FrameBuf {
    fn drop(&mut self) {
        // Safe because `addr` came from `alloc_zeroed` with this layout.
        unsafe { dealloc(self.addr, self.layout) };
    }
}

/// The three plane views of a frame or of one slice row's strip of it.
#[derive(Copy, Clone)]
pub struct Planes<'a> {
    pub y: VolatileSlice<'a>,
    pub cb: VolatileSlice<'a>,
    pub cr: VolatileSlice<'a>,
}

struct FrameInner {
    state: FrameState,
    /// Weak reference to the handle currently bound to this frame. Unset
    /// exactly when the state is `Free`.
    handle: Option<Weak<FrameHandle>>,
    /// One context per macroblock row, initialized on lock.
    rows: Vec<SliceRow>,
}

/// One fixed-size YCbCr buffer owned by the pool.
///
/// The buffer is allocated once at pool construction and freed only at pool
/// teardown. All state transitions assert their precondition state and are
/// serialized by the frame's mutex; transitions observable by
/// [`wait_rendered`](Frame::wait_rendered) broadcast the frame's condition
/// variable.
pub struct Frame {
    index: usize,
    layout: FrameLayout,
    buf: FrameBuf,
    inner: Mutex<FrameInner>,
    activity: Condvar,
}

impl Frame {
    pub(crate) fn new(index: usize, layout: FrameLayout) -> Frame {
        Frame {
            index,
            layout,
            buf: FrameBuf::new(layout.frame_size()),
            inner: Mutex::new(FrameInner {
                state: FrameState::Free,
                handle: None,
                rows: vec![SliceRow::default(); layout.mb_height()],
            }),
            activity: Condvar::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn state(&self) -> FrameState {
        self.inner.lock().state
    }

    /// The whole I420 buffer.
    pub fn buffer(&self) -> VolatileSlice {
        self.buf.slice()
    }

    /// Per-plane views of the whole frame.
    pub fn planes(&self) -> Planes {
        let buf = self.buf.slice();
        Planes {
            y: buf.slice(0, self.layout.luma_size()),
            cb: buf.slice(self.layout.cb_offset(), self.layout.chroma_size()),
            cr: buf.slice(self.layout.cr_offset(), self.layout.chroma_size()),
        }
    }

    /// The three strips of the buffer that slice row `row` renders into.
    /// Strips of distinct rows are disjoint, so row workers may write them
    /// concurrently.
    pub fn slice_row_planes(&self, row: usize) -> Planes {
        let buf = self.buf.slice();
        let y = self.layout.luma_row(row);
        let cb = self.layout.cb_row(row);
        let cr = self.layout.cr_row(row);
        Planes {
            y: buf.slice(y.start, y.len()),
            cb: buf.slice(cb.start, cb.len()),
            cr: buf.slice(cr.start, cr.len()),
        }
    }

    /// Returns a copy of slice row `row`'s decode context.
    pub fn slice_row(&self, row: usize) -> SliceRow {
        self.inner.lock().rows[row].clone()
    }

    /// Free -> Locked: binds the frame to `handle` and seeds every slice row
    /// with `pic`'s motion-vector codes and prediction anchors.
    pub(crate) fn lock(&self, handle: Weak<FrameHandle>, pic: &dyn Picture) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, FrameState::Free, "frame {} not free", self.index);
        assert!(inner.handle.is_none(), "free frame {} has a handle", self.index);
        inner.handle = Some(handle);
        inner.state = FrameState::Locked;

        let f_code_fv = pic.f_code_fv();
        let f_code_bv = pic.f_code_bv();
        let forward = pic.forward();
        let backward = pic.backward();
        for row in inner.rows.iter_mut() {
            row.init(f_code_fv, f_code_bv, forward.clone(), backward.clone());
        }
        trace!("frame {}: locked", self.index);
    }

    /// Locked -> Rendered: every slice row is complete. Wakes all waiters;
    /// this broadcast publishes the pixel writes to them.
    pub fn set_rendered(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            FrameState::Locked,
            "frame {} rendered while not locked",
            self.index
        );
        inner.state = FrameState::Rendered;
        trace!("frame {}: rendered", self.index);
        self.activity.notify_all();
    }

    /// Freeable -> Rendered: a new reference arrived before the pool
    /// reclaimed the buffer, so the still-valid pixels are rescued.
    fn relock(&self, inner: &mut FrameInner) {
        assert_eq!(
            inner.state,
            FrameState::Freeable,
            "frame {} relocked while not freeable",
            self.index
        );
        inner.state = FrameState::Rendered;
        trace!("frame {}: relocked", self.index);
        self.activity.notify_all();
    }

    /// Freeable -> Rendered, but only if the frame is still bound to
    /// `handle`. Returns whether it was; a `false` return means the pool got
    /// there first and the binding is gone.
    pub(crate) fn relock_if_bound(&self, handle: &FrameHandle) -> bool {
        let mut inner = self.inner.lock();
        let bound = matches!(
            &inner.handle,
            Some(weak) if std::ptr::eq(weak.as_ptr(), handle)
        );
        if bound {
            self.relock(&mut inner);
        }
        bound
    }

    /// Rendered -> Freeable: the last reference was dropped after rendering
    /// completed. The binding stays in place so the handle can resurrect the
    /// pixels until the pool reclaims them.
    pub(crate) fn set_freeable(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            FrameState::Rendered,
            "frame {} made freeable while not rendered",
            self.index
        );
        inner.state = FrameState::Freeable;
        trace!("frame {}: freeable", self.index);
    }

    /// Locked -> Free: decoding was abandoned before completion. The pixels
    /// are not valid and must not be resurrected. The handle performing this
    /// transition clears its own frame pointer.
    pub(crate) fn free_locked(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            FrameState::Locked,
            "frame {} freed while not locked",
            self.index
        );
        inner.handle = None;
        inner.state = FrameState::Free;
        for row in inner.rows.iter_mut() {
            row.clear();
        }
        trace!("frame {}: freed before rendering", self.index);
    }

    /// Freeable -> Free: the pool is reclaiming the buffer for someone else.
    /// Returns the evicted binding so the caller can notify that handle once
    /// no pool or frame lock is held.
    pub(crate) fn free(&self) -> Option<Weak<FrameHandle>> {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            FrameState::Freeable,
            "frame {} reclaimed while not freeable",
            self.index
        );
        let handle = inner.handle.take();
        inner.state = FrameState::Free;
        for row in inner.rows.iter_mut() {
            row.clear();
        }
        trace!("frame {}: reclaimed", self.index);
        handle
    }

    /// Blocks until the frame reaches `Rendered`.
    ///
    /// The caller must hold a reference on the frame's handle (directly or
    /// through a cooperating thread) for the duration of the wait, otherwise
    /// the frame could be reclaimed and rebound while the wait is parked on
    /// it.
    pub fn wait_rendered(&self) {
        let mut inner = self.inner.lock();
        while inner.state != FrameState::Rendered {
            inner = self.activity.wait(inner);
        }
    }
}
