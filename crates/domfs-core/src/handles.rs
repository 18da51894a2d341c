// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-session descriptor allocation
//!
//! Handles are uniqueness tokens only. Every operation is keyed by path, so
//! nothing is ever looked up by handle and nothing needs releasing.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct HandleAllocator {
    last: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next handle; the first one is 1.
    pub fn allocate(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Most recently allocated handle, 0 before the first allocation
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}
