// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Camera pose and pinhole intrinsics, validated at every boundary.

use nalgebra::DMatrix;

use crate::errors::Error;
use crate::misc::type_aliases::{Mat3d, Mat4d, Vec3d};

/// Tolerance on orthonormality and determinant checks of a rotation.
const ROTATION_EPSILON: f64 = 1e-6;

// POSE ####################################################

/// A rigid camera transform, mapping world coordinates to camera
/// coordinates as `x_cam = R * x_world + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    rotation: Mat3d,
    translation: Vec3d,
}

impl Pose {
    /// Build a pose from a rotation matrix and a translation vector.
    ///
    /// Fails with `Error::InvalidPose` if the rotation is not orthonormal
    /// with determinant 1 (up to a small tolerance).
    pub fn new(rotation: Mat3d, translation: Vec3d) -> Result<Self, Error> {
        let ortho = (rotation * rotation.transpose() - Mat3d::identity()).norm();
        if ortho > ROTATION_EPSILON {
            return Err(Error::InvalidPose(format!(
                "rotation is not orthonormal (|R Rt - I| = {})",
                ortho
            )));
        }
        let det = rotation.determinant();
        if (det - 1.0).abs() > ROTATION_EPSILON {
            return Err(Error::InvalidPose(format!(
                "rotation determinant is {} instead of 1",
                det
            )));
        }
        Ok(Self {
            rotation,
            translation,
        })
    }

    /// The identity pose (camera at the world origin).
    pub fn identity() -> Self {
        Self {
            rotation: Mat3d::identity(),
            translation: Vec3d::zeros(),
        }
    }

    /// Build a pose from dynamically sized matrices, the shape callers at
    /// the process boundary usually hold.
    ///
    /// Fails with `Error::InvalidPose` unless the rotation is 3x3 and the
    /// translation 3x1.
    pub fn from_parts(rotation: &DMatrix<f64>, translation: &DMatrix<f64>) -> Result<Self, Error> {
        if rotation.shape() != (3, 3) {
            return Err(Error::InvalidPose(format!(
                "rotation shape is {:?} instead of (3, 3)",
                rotation.shape()
            )));
        }
        if translation.shape() != (3, 1) {
            return Err(Error::InvalidPose(format!(
                "translation shape is {:?} instead of (3, 1)",
                translation.shape()
            )));
        }
        let r = Mat3d::from_iterator(rotation.iter().cloned());
        let t = Vec3d::from_iterator(translation.iter().cloned());
        Self::new(r, t)
    }

    /// The rotation part.
    pub fn rotation(&self) -> &Mat3d {
        &self.rotation
    }

    /// The translation part.
    pub fn translation(&self) -> &Vec3d {
        &self.translation
    }

    /// The 4x4 homogeneous world-to-camera matrix `[R t; 0 0 0 1]`.
    pub fn matrix(&self) -> Mat4d {
        let mut m = Mat4d::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

// INTRINSICS ##############################################

/// Pinhole camera intrinsic parameters.
///
/// The matrix form is upper triangular with the canonical last
/// row `[0, 0, 1]`, which every construction path guarantees.
#[derive(Debug, Clone, PartialEq)]
pub struct Intrinsics {
    /// Principal point (cx, cy) in pixels.
    pub principal_point: (f64, f64),
    /// Focal scaling (fx, fy) in pixels.
    pub focals: (f64, f64),
    /// Skew coefficient, usually 0.
    pub skew: f64,
}

impl Intrinsics {
    /// Build intrinsics from an explicit 3x3 camera matrix.
    ///
    /// Fails with `Error::InvalidIntrinsics` if the matrix violates the
    /// canonical constraints: entries (2,0), (2,1) and (1,0) must be 0 and
    /// entry (2,2) must be 1.
    pub fn from_matrix(mat: &Mat3d) -> Result<Self, Error> {
        if mat[(2, 0)] != 0.0 || mat[(2, 1)] != 0.0 || mat[(2, 2)] != 1.0 {
            return Err(Error::InvalidIntrinsics(format!(
                "last row is [{}, {}, {}] instead of [0, 0, 1]",
                mat[(2, 0)],
                mat[(2, 1)],
                mat[(2, 2)]
            )));
        }
        if mat[(1, 0)] != 0.0 {
            return Err(Error::InvalidIntrinsics(
                "entry (1, 0) must be 0 in a pinhole matrix".to_string(),
            ));
        }
        Ok(Self {
            principal_point: (mat[(0, 2)], mat[(1, 2)]),
            focals: (mat[(0, 0)], mat[(1, 1)]),
            skew: mat[(0, 1)],
        })
    }

    /// The 3x3 camera matrix.
    pub fn matrix(&self) -> Mat3d {
        Mat3d::new(
            self.focals.0,
            self.skew,
            self.principal_point.0,
            0.0,
            self.focals.1,
            self.principal_point.1,
            0.0,
            0.0,
            1.0,
        )
    }

    /// The camera matrix embedded in a 4x4 identity, as needed by the
    /// depth-carrying reprojection chain.
    pub fn matrix4(&self) -> Mat4d {
        let mut m = Mat4d::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.matrix());
        m
    }
}

// TESTS #############################################################
