// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error taxonomy of the reconstruction core.
//!
//! All validation errors are raised eagerly at call entry, before any
//! allocation or mutation, so a failed call leaves prior state untouched.
//! A per-cell out-of-bounds projection during fusion is *not* an error:
//! the cell is silently excluded from blending.

use thiserror::Error;

use crate::device::context::DeviceError;

/// Errors reported by the reconstruction core.
#[derive(Debug, Error)]
pub enum Error {
    /// A pose did not satisfy the 3x3 orthonormal rotation / 3x1
    /// translation contract.
    #[error("invalid pose: {0}")]
    InvalidPose(String),
    /// An intrinsics matrix violated the canonical last row [0, 0, 1].
    #[error("invalid intrinsics: {0}")]
    InvalidIntrinsics(String),
    /// An image or buffer extent does not match what the store expects.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
    /// A frame arrived in a channel/sample-depth combination the staging
    /// step does not recognize.
    #[error("unsupported frame format: {0}")]
    UnsupportedFormat(String),
    /// A required pose or intrinsics inverse does not exist.
    #[error("singular pose or intrinsics: {0}")]
    SingularPose(String),
    /// The GPU backend failed to initialize or execute.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}
