// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accelerator backends.
//!
//! A backend implements [`crate::accel::VideoAccelerator`] on top of an actual driver. This crate
//! ships a recording software backend that lets the decoding core run, and be tested, without
//! any hardware.

pub mod dummy;
