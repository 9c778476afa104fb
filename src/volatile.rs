// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Volatile views of frame pixel memory.
//!
//! While a frame is being rendered, several slice-row workers write disjoint
//! regions of one allocation at the same time; once it is rendered, any
//! number of threads read it. Forming `&`/`&mut` slices over memory used
//! that way would violate pointer aliasing, so pixel bytes are only ever
//! reached through [`VolatileSlice`]: a raw pointer plus length whose
//! accessors all compile to volatile loads and stores.
//!
//! Volatile access keeps the compiler from reordering or eliding the
//! operations, but it is not a synchronization primitive. Publication of
//! written pixels to readers is the job of the frame's mutex and condition
//! variable.

use std::marker::PhantomData;
use std::ptr::read_volatile;
use std::ptr::write_bytes;
use std::ptr::write_volatile;

/// A length-checked window of raw memory supporting only volatile access.
#[derive(Copy, Clone, Debug)]
pub struct VolatileSlice<'a> {
    addr: *mut u8,
    len: usize,
    phantom: PhantomData<&'a u8>,
}

// Safe because the wrapped pointer is only dereferenced with volatile
// operations, which remain defined under concurrent access from other
// threads.
unsafe impl Send for VolatileSlice<'_> {}
unsafe impl Sync for VolatileSlice<'_> {}

impl<'a> VolatileSlice<'a> {
    /// Creates a view of `len` bytes of raw memory at `addr`.
    ///
    /// To use this safely, the caller must guarantee the memory stays valid
    /// for the lifetime of the view and that every other user of it also
    /// goes through volatile access.
    pub unsafe fn new(addr: *mut u8, len: usize) -> VolatileSlice<'a> {
        VolatileSlice {
            addr,
            len,
            phantom: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the sub-view of `len` bytes starting at `offset`.
    ///
    /// Panics when the range falls outside the slice; ranges here are
    /// derived from frame layout constants, so an out-of-range request is a
    /// bug rather than a runtime condition.
    pub fn slice(self, offset: usize, len: usize) -> VolatileSlice<'a> {
        let end = offset
            .checked_add(len)
            .unwrap_or_else(|| panic!("slice {}+{} overflows", offset, len));
        assert!(
            end <= self.len,
            "slice {}..{} out of range for {} bytes",
            offset,
            end,
            self.len
        );
        // Safe because the sub-view covers a subset of memory that `self`
        // already guarantees valid, for the same lifetime.
        unsafe { VolatileSlice::new(self.addr.add(offset), len) }
    }

    /// Reads the byte at `offset`.
    pub fn load(&self, offset: usize) -> u8 {
        assert!(offset < self.len, "load at {} out of range", offset);
        // Safe because the offset was checked against the view's extent.
        unsafe { read_volatile(self.addr.add(offset)) }
    }

    /// Writes the byte at `offset`.
    pub fn store(&self, offset: usize, value: u8) {
        assert!(offset < self.len, "store at {} out of range", offset);
        // Safe because the offset was checked against the view's extent.
        unsafe { write_volatile(self.addr.add(offset), value) }
    }

    /// Sets every byte of the view to `value`, like `memset`.
    pub fn write_bytes(&self, value: u8) {
        // Safe because the memory is valid and needs only byte alignment.
        unsafe {
            write_bytes(self.addr, value, self.len);
        }
    }

    /// Copies `min(self.len(), buf.len())` bytes out of the view into `buf`,
    /// lowest address first.
    pub fn copy_to(&self, buf: &mut [u8]) {
        for (offset, dst) in buf.iter_mut().take(self.len).enumerate() {
            // Safe because the iterator is bounded by the view's extent.
            *dst = unsafe { read_volatile(self.addr.add(offset)) };
        }
    }

    /// Copies `min(self.len(), buf.len())` bytes from `buf` into the view,
    /// lowest address first.
    pub fn copy_from(&self, buf: &[u8]) {
        for (offset, src) in buf.iter().take(self.len).enumerate() {
            // Safe because the iterator is bounded by the view's extent.
            unsafe { write_volatile(self.addr.add(offset), *src) };
        }
    }
}
