// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitive wrappers that codify our poisoning policy.
//!
//! The process is built with the assumption that a panic anywhere is fatal,
//! so a poisoned lock can never be observed by code that is still running.
//! These wrappers turn the `PoisonError` plumbing of the standard library
//! primitives into a panic, which keeps `.lock().unwrap()` noise out of the
//! state-machine code that uses them.

mod condvar;
mod mutex;

pub use crate::condvar::Condvar;
pub use crate::mutex::Mutex;
