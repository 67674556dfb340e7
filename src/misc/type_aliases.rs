// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Type aliases for common types used all over the code base.

use nalgebra as na;

/// Per-pixel data (cost, imagery, depth maps) is computed in f32.
pub type Float = f32;

/// A point with two Float coordinates.
pub type Point2 = na::Point2<Float>;
/// A point with three Float coordinates.
pub type Point3 = na::Point3<Float>;

/// A vector with three Float coordinates.
pub type Vec3 = na::Vector3<Float>;

/// A 3x3 matrix of Floats.
pub type Mat3 = na::Matrix3<Float>;
/// A 3x4 matrix of Floats.
pub type Mat3x4 = na::Matrix3x4<Float>;
/// A 4x4 matrix of Floats.
pub type Mat4 = na::Matrix4<Float>;

// Projection matrices are assembled and inverted in f64 and only cast
// down to Float for the per-pixel inner loops.

/// A vector with three f64 coordinates.
pub type Vec3d = na::Vector3<f64>;
/// A 3x3 matrix of f64.
pub type Mat3d = na::Matrix3<f64>;
/// A 3x4 matrix of f64.
pub type Mat3x4d = na::Matrix3x4<f64>;
/// A 4x4 matrix of f64.
pub type Mat4d = na::Matrix4<f64>;
