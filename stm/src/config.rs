// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    address::{MAX_SEGMENT_BYTES, MAX_SLOTS},
    Result, TxError,
};

/// Decides when a beginning transaction may join an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Admission {
    /// Join the running epoch right away. Only a draining epoch transition makes
    /// arriving transactions wait.
    #[default]
    Open,

    /// Wait for the next epoch whenever the running one has active members. Every
    /// epoch then consists of the transactions that were admitted together.
    ///
    /// Note: a thread holding an active transaction must not begin another one under
    /// this policy, as it would wait for its own epoch to end.
    Batched,
}

/// Config for a shared memory [`crate::Region`].
///
/// [`Default`] describes a region of a single 8 byte word with [`Admission::Open`], no memory
/// limit for dynamic allocations and the maximum number of segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    pub(crate) size: usize,
    pub(crate) align: usize,
    pub(crate) admission: Admission,
    pub(crate) memory_limit: Option<usize>,
    pub(crate) max_segments: usize,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            size: 8,
            align: 8,
            admission: Admission::Open,
            memory_limit: None,
            max_segments: MAX_SLOTS - 1,
        }
    }
}

impl RegionConfig {
    /// Create a new config with a root segment of `size` bytes, made of words of `align`
    /// bytes. `size` must be a positive multiple of `align` and `align` a power of two.
    pub fn new(size: usize, align: usize) -> Self {
        Self {
            size,
            align,
            ..Default::default()
        }
    }

    /// Set the admission policy of the epoch batcher.
    pub fn with_admission(mut self, admission: Admission) -> Self {
        self.admission = admission;
        self
    }

    /// Limit the total number of bytes held by dynamically allocated segments. Allocations
    /// beyond the limit fail with [`TxError::OutOfMemory`].
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Limit the number of dynamically allocated segments that may exist at once.
    pub fn with_max_segments(mut self, count: usize) -> Self {
        self.max_segments = count;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let (size, align) = (self.size, self.align);
        if !align.is_power_of_two() || size == 0 || size % align != 0 || size >= MAX_SEGMENT_BYTES {
            return Err(TxError::InvalidLayout { size, align });
        }
        Ok(())
    }
}
