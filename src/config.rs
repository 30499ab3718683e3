// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use anyhow::ensure;

use crate::decoder::BlockingMode;
use crate::packer::AccelGeneration;
use crate::packer::PackerCaps;
use crate::packer::Priority;
use crate::packer::ProcessingParams;
use crate::packer::SliceMode;
use crate::packer::SLICE_DATA_ALIGNMENT;
use crate::Codec;

/// Parameters of a decoding session, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub codec: Codec,
    pub generation: AccelGeneration,
    /// Whether slice data is encrypted and described by encryption parameters.
    pub protected: bool,
    pub slice_mode: SliceMode,
    /// Number of frame descriptors, i.e. of frames that can be in flight at once.
    pub pool_size: usize,
    /// Number of frames acquired after a frame before it can be reclaimed.
    pub reorder_delay: u64,
    /// How long a blocking status sync waits for the accelerator.
    pub sync_timeout: Duration,
    /// Size of the slice data buffer of one hardware round.
    pub slice_data_capacity: usize,
    pub priority: Priority,
    /// Highest context priority the accelerator accepts.
    pub max_priority: u16,
    pub processing: Option<ProcessingParams>,
    pub blocking_mode: BlockingMode,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            generation: Default::default(),
            protected: false,
            slice_mode: Default::default(),
            pool_size: 24,
            reorder_delay: 0,
            sync_timeout: Duration::from_secs(1),
            slice_data_capacity: 1 << 20,
            priority: Default::default(),
            max_priority: 1024,
            processing: None,
            blocking_mode: Default::default(),
        }
    }
}

impl DecoderConfig {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            ..Default::default()
        }
    }

    pub fn generation(mut self, generation: AccelGeneration) -> Self {
        self.generation = generation;
        self
    }

    pub fn protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }

    pub fn slice_mode(mut self, slice_mode: SliceMode) -> Self {
        self.slice_mode = slice_mode;
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn reorder_delay(mut self, reorder_delay: u64) -> Self {
        self.reorder_delay = reorder_delay;
        self
    }

    pub fn sync_timeout(mut self, sync_timeout: Duration) -> Self {
        self.sync_timeout = sync_timeout;
        self
    }

    pub fn slice_data_capacity(mut self, slice_data_capacity: usize) -> Self {
        self.slice_data_capacity = slice_data_capacity;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn processing(mut self, processing: Option<ProcessingParams>) -> Self {
        self.processing = processing;
        self
    }

    pub fn blocking_mode(mut self, blocking_mode: BlockingMode) -> Self {
        self.blocking_mode = blocking_mode;
        self
    }

    /// Checks that a decoder can be created from this configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.pool_size > 0, "the descriptor pool cannot be empty");
        ensure!(
            self.slice_data_capacity >= SLICE_DATA_ALIGNMENT,
            "slice data capacity of {} bytes is below the {} bytes alignment",
            self.slice_data_capacity,
            SLICE_DATA_ALIGNMENT
        );
        ensure!(
            !(self.protected && self.codec == Codec::Vc1),
            "protected content is not supported for VC1"
        );

        Ok(())
    }

    /// Capabilities handed to [`crate::packer::create`].
    pub fn packer_caps(&self) -> PackerCaps {
        PackerCaps {
            codec: self.codec,
            generation: self.generation,
            protected: self.protected,
            slice_mode: self.slice_mode,
            priority: self.priority,
            max_priority: self.max_priority,
            processing: self.processing,
        }
    }
}
