// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference-counted binding between a picture and the frame realizing it.

use std::sync::Arc;
use std::sync::Weak;

use log::debug;
use sync::Condvar;
use sync::Mutex;

use crate::frame::Frame;
use crate::frame::FrameState;
use crate::picture::Picture;
use crate::pool;
use crate::pool::BufferPool;

struct HandleInner {
    /// Index of the bound frame, if any. `None` together with `locks == 0`
    /// is the quiescent unrealized state.
    frame: Option<usize>,
    locks: usize,
}

/// The only legal channel through which callers obtain or release frames.
///
/// A handle starts with no frame. The first reference pulls a buffer from
/// the pool and binds it; further references just count. When the count
/// returns to zero the frame is surrendered to the pool: kept resurrectable
/// if it was rendered, recycled immediately if decode was abandoned. A
/// handle whose rendered frame went freeable may win it back on the next
/// reference, or lose it to the pool and transparently bind a fresh buffer.
///
/// Handles are shared across decoder, display, and control threads via
/// `Arc`; all state lives behind the handle's own mutex, which is always
/// acquired before any pool or frame mutex.
pub struct FrameHandle {
    pool: Arc<BufferPool>,
    pic: Weak<dyn Picture>,
    weak_self: Weak<FrameHandle>,
    inner: Mutex<HandleInner>,
    activity: Condvar,
}

impl FrameHandle {
    /// Creates the handle for `pic`, bound to no frame.
    pub fn new(pool: Arc<BufferPool>, pic: Weak<dyn Picture>) -> Arc<FrameHandle> {
        Arc::new_cyclic(|weak_self| FrameHandle {
            pool,
            pic,
            weak_self: weak_self.clone(),
            inner: Mutex::new(HandleInner {
                frame: None,
                locks: 0,
            }),
            activity: Condvar::new(),
        })
    }

    /// Takes a reference on the picture's frame, realizing one if needed.
    ///
    /// With a frame already bound and other references outstanding this is
    /// just a count bump. With a freeable frame still bound, the frame is
    /// rescued from the pool's reclaim queue and its pixels stay valid. With
    /// no frame (or a binding the pool reclaimed first), a buffer is pulled
    /// from the pool and locked with the picture's decode context.
    ///
    /// Fails with [`pool::Error::OutOfFrames`] when every buffer in the pool
    /// is referenced.
    pub fn increment_lockcount(&self) -> pool::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.frame {
            if inner.locks == 0 {
                if self.pool.try_resurrect(index, self) {
                    inner.locks = 1;
                } else {
                    // The pool reclaimed the frame before we could rescue
                    // it; the detach notification may still be in flight.
                    debug!("handle lost frame {} to eviction; rebinding", index);
                    inner.frame = None;
                    self.acquire_frame(&mut inner)?;
                }
            } else {
                inner.locks += 1;
            }
        } else {
            assert_eq!(inner.locks, 0, "references held with no frame bound");
            self.acquire_frame(&mut inner)?;
        }
        Ok(())
    }

    /// Binds a fresh frame from the pool and takes the first reference.
    /// Caller holds the handle mutex and has verified nothing is bound.
    fn acquire_frame(&self, inner: &mut HandleInner) -> pool::Result<()> {
        let (index, evicted) = self.pool.get_free_frame()?;
        if let Some(loser) = evicted {
            // The pool mutex is released by now; only our own handle mutex
            // is held. A handle with a bound frame never evicts, so `loser`
            // can never be this handle.
            debug_assert!(!std::ptr::eq(loser.as_ptr(), self));
            if let Some(loser) = loser.upgrade() {
                loser.detach_frame(index);
            }
        }
        let pic = match self.pic.upgrade() {
            Some(pic) => pic,
            None => panic!("picture dropped while its frame handle is in use - this is a bug"),
        };
        self.pool.frame(index).lock(self.weak_self.clone(), pic.as_ref());
        inner.frame = Some(index);
        inner.locks = 1;
        // Threads in wait_rendered may be waiting for a frame to appear.
        self.activity.notify_all();
        Ok(())
    }

    /// Drops one reference. On the last drop the frame is surrendered: a
    /// rendered frame goes to the freeable queue with the binding intact, a
    /// still-locked frame (abandoned decode) goes back to the free queue and
    /// the binding is severed.
    pub fn decrement_lockcount(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.locks > 0, "lock count underflow on frame handle");
        inner.locks -= 1;
        if inner.locks > 0 {
            return;
        }
        let index = match inner.frame {
            Some(index) => index,
            None => panic!("references were held with no frame bound - this is a bug"),
        };
        match self.pool.frame(index).state() {
            FrameState::Rendered => self.pool.make_freeable(index),
            FrameState::Locked => {
                self.pool.make_free(index);
                inner.frame = None;
            }
            state => panic!(
                "frame {} in state {:?} while references were held - this is a bug",
                index, state
            ),
        }
    }

    /// Pool notification that `index` was reclaimed out from under this
    /// handle. Tolerates staleness: if the handle already noticed the loss
    /// (via a failed resurrection) and rebound, there is nothing to do.
    pub(crate) fn detach_frame(&self, index: usize) {
        let mut inner = self.inner.lock();
        if inner.frame != Some(index) {
            return;
        }
        assert_eq!(inner.locks, 0, "pool reclaimed a referenced frame");
        inner.frame = None;
        // Waiters need to observe the loss and retry.
        self.activity.notify_all();
    }

    /// Blocks until this picture's frame holds rendered pixels.
    ///
    /// Waits first for a frame to be bound (another thread's increment), then
    /// for that frame to finish rendering. The caller must ensure a reference
    /// is held, by itself or by a cooperating thread, for the duration of the
    /// wait; an unreferenced frame could otherwise be reclaimed and rebound
    /// while the wait is parked on it.
    ///
    /// The handle's mutex stays held while the wait is parked on the frame,
    /// so threads that render or inspect the frame concurrently must capture
    /// their [`frame`](FrameHandle::frame) reference before the wait begins.
    pub fn wait_rendered(&self) {
        let mut inner = self.inner.lock();
        let index = loop {
            match inner.frame {
                Some(index) => break index,
                None => inner = self.activity.wait(inner),
            }
        };
        // The handle mutex stays held across the frame wait; the pool takes
        // it to detach, so the binding cannot change under us.
        self.pool.frame(index).wait_rendered();
    }

    /// The bound frame, if one is currently realized.
    ///
    /// The binding is a snapshot; it can only be relied upon while the
    /// caller holds a reference.
    pub fn frame(&self) -> Option<&Frame> {
        let index = self.inner.lock().frame?;
        Some(self.pool.frame(index))
    }

    pub fn lock_count(&self) -> usize {
        self.inner.lock().locks
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::picture::tests::StubPicture;
    use crate::pool::Error;

    fn handle_for(pool: &Arc<BufferPool>, pic: &Arc<StubPicture>) -> Arc<FrameHandle> {
        let pic: Arc<dyn Picture> = pic.clone();
        let pic: Weak<dyn Picture> = Arc::downgrade(&pic);
        FrameHandle::new(pool.clone(), pic)
    }

    fn rendered_handle(pool: &Arc<BufferPool>, pic: &Arc<StubPicture>) -> Arc<FrameHandle> {
        let handle = handle_for(pool, pic);
        handle.increment_lockcount().unwrap();
        handle.frame().unwrap().set_rendered();
        handle
    }

    #[test]
    fn single_frame_lifecycle() {
        let pool = BufferPool::new(1, 1, 1);
        let pic = Arc::new(StubPicture::intra());
        let handle = handle_for(&pool, &pic);

        handle.increment_lockcount().unwrap();
        assert_eq!(handle.lock_count(), 1);
        assert_eq!(handle.frame().unwrap().state(), FrameState::Locked);
        assert_eq!(pool.num_free(), 0);

        handle.frame().unwrap().set_rendered();
        handle.wait_rendered();

        handle.decrement_lockcount();
        assert_eq!(handle.lock_count(), 0);
        assert_eq!(handle.frame().unwrap().state(), FrameState::Freeable);
        assert_eq!(pool.num_freeable(), 1);

        // A new reference resurrects the frame from the freeable queue.
        handle.increment_lockcount().unwrap();
        assert_eq!(handle.frame().unwrap().state(), FrameState::Rendered);
        assert_eq!(pool.num_freeable(), 0);
        handle.decrement_lockcount();
    }

    #[test]
    fn resurrection_preserves_pixels() {
        let pool = BufferPool::new(1, 1, 1);
        let pic = Arc::new(StubPicture::intra());
        let handle = handle_for(&pool, &pic);

        handle.increment_lockcount().unwrap();
        handle.frame().unwrap().planes().y.write_bytes(0x42);
        handle.frame().unwrap().set_rendered();
        handle.decrement_lockcount();

        handle.increment_lockcount().unwrap();
        handle.wait_rendered();
        let frame = handle.frame().unwrap();
        let mut luma = vec![0u8; frame.layout().luma_size()];
        frame.planes().y.copy_to(&mut luma);
        assert!(luma.iter().all(|&b| b == 0x42));
        handle.decrement_lockcount();
    }

    #[test]
    fn eviction_detaches_the_oldest_release() {
        let pool = BufferPool::new(2, 1, 1);
        let pics: Vec<_> = (0..3).map(|_| Arc::new(StubPicture::intra())).collect();

        let h1 = rendered_handle(&pool, &pics[0]);
        let first = h1.frame().unwrap().index();
        h1.decrement_lockcount();

        let h2 = rendered_handle(&pool, &pics[1]);
        h2.decrement_lockcount();

        let h3 = handle_for(&pool, &pics[2]);
        h3.increment_lockcount().unwrap();

        // h1 released first, so its frame was the FIFO head of freeable.
        assert_eq!(h3.frame().unwrap().index(), first);
        assert!(h1.frame().is_none());
        assert_eq!(h2.frame().unwrap().state(), FrameState::Freeable);
        assert_eq!(pool.num_freeable(), 1);
        h3.decrement_lockcount();
    }

    #[test]
    fn exhaustion_surfaces_out_of_frames() {
        let pool = BufferPool::new(1, 1, 1);
        let pic1 = Arc::new(StubPicture::intra());
        let pic2 = Arc::new(StubPicture::intra());

        let h1 = handle_for(&pool, &pic1);
        h1.increment_lockcount().unwrap();

        // h1's frame is locked, not freeable, so nothing can be evicted.
        let h2 = handle_for(&pool, &pic2);
        assert!(matches!(
            h2.increment_lockcount(),
            Err(Error::OutOfFrames(1))
        ));
        assert!(h2.frame().is_none());
        h1.decrement_lockcount();
    }

    #[test]
    fn abandoned_decode_recycles_immediately() {
        let pool = BufferPool::new(1, 1, 1);
        let pic = Arc::new(StubPicture::intra());
        let handle = handle_for(&pool, &pic);

        handle.increment_lockcount().unwrap();
        handle.decrement_lockcount();

        // No set_rendered happened: the frame is not resurrectable.
        assert!(handle.frame().is_none());
        assert_eq!(pool.num_free(), 1);
        assert_eq!(pool.num_freeable(), 0);
    }

    #[test]
    fn second_reference_is_only_a_count_bump() {
        let pool = BufferPool::new(1, 1, 1);
        let pic = Arc::new(StubPicture::intra());
        let handle = handle_for(&pool, &pic);

        handle.increment_lockcount().unwrap();
        handle.increment_lockcount().unwrap();
        assert_eq!(handle.lock_count(), 2);
        assert_eq!(pool.num_free(), 0);

        handle.decrement_lockcount();
        assert_eq!(handle.frame().unwrap().state(), FrameState::Locked);
        handle.decrement_lockcount();
        assert_eq!(pool.num_free(), 1);
    }

    #[test]
    fn anchors_reach_the_slice_rows() {
        let pool = BufferPool::new(2, 1, 1);
        let anchor_pic = Arc::new(StubPicture::intra());
        let anchor = rendered_handle(&pool, &anchor_pic);

        let b_pic = Arc::new(StubPicture {
            f_code_fv: 4,
            f_code_bv: 3,
            forward: Some(anchor.clone()),
            backward: None,
        });
        let handle = handle_for(&pool, &b_pic);
        handle.increment_lockcount().unwrap();

        let ctx = handle.frame().unwrap().slice_row(0);
        assert_eq!(ctx.f_code_fv(), 4);
        assert_eq!(ctx.f_code_bv(), 3);
        assert!(Arc::ptr_eq(&ctx.forward().unwrap(), &anchor));
        assert!(ctx.backward().is_none());

        handle.decrement_lockcount();
        anchor.decrement_lockcount();
    }

    #[test]
    fn wait_unblocks_on_render() {
        let pool = BufferPool::new(1, 1, 1);
        let pic = Arc::new(StubPicture::intra());
        let handle = handle_for(&pool, &pic);
        handle.increment_lockcount().unwrap();
        // Captured before the waiter parks; a parked wait holds the handle
        // mutex.
        let frame = handle.frame().unwrap();

        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.wait_rendered())
        };
        thread::sleep(Duration::from_millis(20));
        frame.set_rendered();
        waiter.join().unwrap();
        assert_eq!(frame.state(), FrameState::Rendered);
        handle.decrement_lockcount();
    }

    #[test]
    fn wait_unblocks_when_a_frame_appears() {
        let pool = BufferPool::new(1, 1, 1);
        let pic = Arc::new(StubPicture::intra());
        let handle = handle_for(&pool, &pic);

        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.wait_rendered())
        };
        thread::sleep(Duration::from_millis(20));
        handle.increment_lockcount().unwrap();
        // The waiter may already be parked on the frame holding the handle
        // mutex, so render through the pool's only frame directly.
        pool.frame(0).set_rendered();
        waiter.join().unwrap();
        handle.decrement_lockcount();
    }

    #[test]
    fn rendered_pixels_are_visible_after_wait() {
        let pool = BufferPool::new(1, 2, 2);
        let pic = Arc::new(StubPicture::intra());
        let handle = handle_for(&pool, &pic);
        handle.increment_lockcount().unwrap();
        let index = handle.frame().unwrap().index();

        let writer = {
            let pool = pool.clone();
            thread::spawn(move || {
                let frame = pool.frame(index);
                for row in 0..frame.layout().mb_height() {
                    let planes = frame.slice_row_planes(row);
                    planes.y.write_bytes(0x80 + row as u8);
                    planes.cb.write_bytes(0x40 + row as u8);
                    planes.cr.write_bytes(0x20 + row as u8);
                }
                frame.set_rendered();
            })
        };

        handle.wait_rendered();
        let frame = handle.frame().unwrap();
        let layout = frame.layout();
        let mut buf = vec![0u8; layout.frame_size()];
        frame.buffer().copy_to(&mut buf);
        for row in 0..layout.mb_height() {
            assert!(buf[layout.luma_row(row)].iter().all(|&b| b == 0x80 + row as u8));
            assert!(buf[layout.cb_row(row)].iter().all(|&b| b == 0x40 + row as u8));
            assert!(buf[layout.cr_row(row)].iter().all(|&b| b == 0x20 + row as u8));
        }
        writer.join().unwrap();
        handle.decrement_lockcount();
    }

    #[test]
    fn eviction_loser_rebinds_a_fresh_frame() {
        let pool = BufferPool::new(1, 1, 1);
        let pic1 = Arc::new(StubPicture::intra());
        let pic2 = Arc::new(StubPicture::intra());

        let h1 = rendered_handle(&pool, &pic1);
        h1.decrement_lockcount();

        // h2 evicts h1's freeable frame.
        let h2 = handle_for(&pool, &pic2);
        h2.increment_lockcount().unwrap();
        assert!(h1.frame().is_none());

        // While h2 pins the only frame, h1 cannot rebind.
        assert!(matches!(
            h1.increment_lockcount(),
            Err(Error::OutOfFrames(1))
        ));

        // Once h2 abandons it, h1 gets a fresh (locked, unrendered) frame.
        h2.decrement_lockcount();
        h1.increment_lockcount().unwrap();
        assert_eq!(h1.frame().unwrap().state(), FrameState::Locked);
        h1.decrement_lockcount();
    }

    /// Resurrection racing eviction must produce exactly one winner and
    /// exact accounting, whichever side gets the pool mutex first.
    #[test]
    fn resurrection_races_eviction() {
        for _ in 0..100 {
            let pool = BufferPool::new(1, 1, 1);
            let pic1 = Arc::new(StubPicture::intra());
            let pic2 = Arc::new(StubPicture::intra());

            let h1 = rendered_handle(&pool, &pic1);
            h1.decrement_lockcount();
            let h2 = handle_for(&pool, &pic2);

            let resurrect = {
                let h1 = h1.clone();
                thread::spawn(move || h1.increment_lockcount().is_ok())
            };
            let evict = {
                let h2 = h2.clone();
                thread::spawn(move || h2.increment_lockcount().is_ok())
            };
            let resurrected = resurrect.join().unwrap();
            let evicted = evict.join().unwrap();

            // Exactly one side got the frame.
            assert!(resurrected ^ evicted);
            if resurrected {
                assert_eq!(h1.frame().unwrap().state(), FrameState::Rendered);
                assert!(h2.frame().is_none());
            } else {
                assert_eq!(h2.frame().unwrap().state(), FrameState::Locked);
                assert!(h1.frame().is_none());
            }
            assert_eq!(pool.num_free(), 0);
            assert_eq!(pool.num_freeable(), 0);
        }
    }

    #[test]
    #[should_panic]
    fn decrement_without_reference_is_fatal() {
        let pool = BufferPool::new(1, 1, 1);
        let pic = Arc::new(StubPicture::intra());
        let handle = handle_for(&pool, &pic);
        handle.decrement_lockcount();
    }
}
