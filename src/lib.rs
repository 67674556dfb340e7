// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dense multi-view stereo depth fusion in Rust.
//!
//! This crate contains the geometric and numerical core of a real-time
//! dense reconstruction pipeline: it fuses a stream of posed camera frames
//! into a per-pixel, per-layer photometric cost volume, and it synthesizes
//! and validates cross-view correspondences from a recovered depth map.
//! Fusion can run on a software kernel or on a GPU compute kernel sharing
//! the same per-cell contract.

pub mod core;
pub mod device;
pub mod errors;
pub mod misc;
