// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The contract a logical picture supplies to the frame layer.

use std::sync::Arc;

use crate::handle::FrameHandle;

/// A logical decoded image identity.
///
/// A picture outlives any particular frame binding; it owns its
/// [`FrameHandle`] and supplies the per-picture decode context the pool
/// copies into each slice row when a frame is bound: the motion-vector range
/// codes and the prediction anchors.
///
/// The anchors returned by [`forward`](Picture::forward) and
/// [`backward`](Picture::backward) are the handles of other pictures.
/// Holding the handle alone does not keep the anchor's pixels resident; the
/// decode driver must hold a lock (via
/// [`FrameHandle::increment_lockcount`]) on each anchor for as long as
/// dependent macroblocks decode from it.
pub trait Picture: Send + Sync {
    /// Forward motion-vector range code.
    fn f_code_fv(&self) -> i32;

    /// Backward motion-vector range code.
    fn f_code_bv(&self) -> i32;

    /// Forward prediction anchor, if this picture predicts from one.
    fn forward(&self) -> Option<Arc<FrameHandle>>;

    /// Backward prediction anchor, if this picture predicts from one.
    fn backward(&self) -> Option<Arc<FrameHandle>>;
}
