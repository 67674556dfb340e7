// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Inverse-depth discretization of a keyframe volume and the projective
//! chains built on top of it.
//!
//! The central object is a single 4x4 matrix mapping homogeneous world
//! coordinates straight to `(pixel_x, pixel_y, layer)`, where `layer` is a
//! linear encoding of inverse scene depth: 0 at the far plane and
//! `layers - 1` at the near plane. Any downstream stage can address a
//! volume cell with one matrix multiply, no divide-then-quantize.

use crate::core::camera::{Intrinsics, Pose};
use crate::errors::Error;
use crate::misc::type_aliases::{Float, Mat3x4d, Mat4d};

/// Depth discretization of one keyframe and its combined projection.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGeometry {
    near: Float,
    far: Float,
    layers: usize,
    depth_step: Float,
    projection: Mat4d,
}

impl VolumeGeometry {
    /// Solve the combined world-to-volume projection for one keyframe.
    ///
    /// `near` and `far` are *inverse* depths bounding the volume
    /// (`near` is the largest inverse depth, i.e. the closest plane).
    /// Fails with `Error::DimensionMismatch` if `layers == 0`.
    pub fn new(
        intrinsics: &Intrinsics,
        pose: &Pose,
        near: Float,
        far: Float,
        layers: usize,
    ) -> Result<Self, Error> {
        if layers == 0 {
            return Err(Error::DimensionMismatch(
                "layer count must be at least 1".to_string(),
            ));
        }
        let depth_step = if layers > 1 {
            (near - far) / (layers as Float - 1.0)
        } else {
            0.0
        };

        // Augment the camera matrix so the third output row carries the
        // homogeneous constant and the fourth carries camera depth:
        //   [ K row 0 | 0 ]           [ x_px * z ]
        //   [ K row 1 | 0 ] * x_cam = [ y_px * z ]
        //   [ 0 0 0     1 ]           [ 1        ]
        //   [ 0 0 1     0 ]           [ z        ]
        // After the perspective divide by the fourth row, the third output
        // component is the inverse depth 1/z.
        let k = intrinsics.matrix();
        let mut m = Mat4d::zeros();
        m.fixed_view_mut::<2, 3>(0, 0)
            .copy_from(&k.fixed_view::<2, 3>(0, 0));
        m[(2, 3)] = 1.0;
        m[(3, 2)] = 1.0;
        let mut m = m * pose.matrix();

        // Re-anchor the inverse-depth row at the far plane and stretch it
        // by the layer step, so the third output becomes the layer index.
        let mut row = m.row(2).into_owned() - f64::from(far) * m.row(3).into_owned();
        if layers > 1 {
            row /= f64::from(depth_step);
        }
        m.set_row(2, &row);

        Ok(Self {
            near,
            far,
            layers,
            depth_step,
            projection: m,
        })
    }

    /// Near plane, in inverse depth.
    pub fn near(&self) -> Float {
        self.near
    }

    /// Far plane, in inverse depth.
    pub fn far(&self) -> Float {
        self.far
    }

    /// Number of discrete inverse-depth layers.
    pub fn layers(&self) -> usize {
        self.layers
    }

    /// Inverse-depth increment between consecutive layers.
    pub fn depth_step(&self) -> Float {
        self.depth_step
    }

    /// The 4x4 matrix mapping homogeneous world coordinates to
    /// `(pixel_x, pixel_y, layer)` after the perspective divide.
    pub fn projection(&self) -> &Mat4d {
        &self.projection
    }

    /// Inverse depth encoded by a (possibly fractional) layer index.
    pub fn inverse_depth_of_layer(&self, layer: Float) -> Float {
        self.far + layer * self.depth_step
    }

    /// Direct 3x4 map from a volume cell `(x_px, y_px, layer)` to pixel
    /// coordinates of a frame observed under `frame_pose`, computed once
    /// per fused frame.
    ///
    /// The intrinsics gain a half-pixel offset so integer coordinates land
    /// on texel centers under bilinear sampling. Fails with
    /// `Error::SingularPose` if the volume projection is not invertible.
    pub fn image_from_volume(
        &self,
        intrinsics: &Intrinsics,
        frame_pose: &Pose,
    ) -> Result<Mat3x4d, Error> {
        let mut k_tex = Mat3x4d::zeros();
        k_tex
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&intrinsics.matrix());
        k_tex[(0, 2)] += 0.5;
        k_tex[(1, 2)] += 0.5;
        let image_from_world = k_tex * frame_pose.matrix();
        let world_from_volume = self.projection.try_inverse().ok_or_else(|| {
            Error::SingularPose("volume projection is not invertible".to_string())
        })?;
        Ok(image_from_world * world_from_volume)
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::misc::type_aliases::Vec3d;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector4;

    fn test_intrinsics() -> Intrinsics {
        Intrinsics {
            principal_point: (32.0, 16.0),
            focals: (100.0, 100.0),
            skew: 0.0,
        }
    }

    #[test]
    fn zero_layers_is_rejected() {
        let result = VolumeGeometry::new(&test_intrinsics(), &Pose::identity(), 0.5, 0.1, 0);
        assert!(matches!(result, Err(Error::DimensionMismatch(_))));
    }

    #[test]
    fn world_point_projects_to_its_layer() {
        let intrinsics = test_intrinsics();
        let geom = VolumeGeometry::new(&intrinsics, &Pose::identity(), 0.5, 0.1, 5).unwrap();
        assert_abs_diff_eq!(0.1, geom.depth_step(), epsilon = 1e-6);

        // A world point whose inverse depth falls exactly on layer 3.
        let id = geom.inverse_depth_of_layer(3.0);
        let z = f64::from(1.0 / id);
        let (px, py) = (40.0, 10.0);
        let x = (px - 32.0) * z / 100.0;
        let y = (py - 16.0) * z / 100.0;

        let h = geom.projection() * Vector4::new(x, y, z, 1.0);
        let w = h[3];
        assert_abs_diff_eq!(px, h[0] / w, epsilon = 1e-9);
        assert_abs_diff_eq!(py, h[1] / w, epsilon = 1e-9);
        assert_abs_diff_eq!(3.0, h[2] / w, epsilon = 1e-9);
    }

    #[test]
    fn far_plane_point_projects_to_layer_zero() {
        let intrinsics = test_intrinsics();
        let geom = VolumeGeometry::new(&intrinsics, &Pose::identity(), 0.5, 0.1, 5).unwrap();
        let z = f64::from(1.0 / 0.1);
        let h = geom.projection() * Vector4::new(0.0, 0.0, z, 1.0);
        assert_abs_diff_eq!(0.0, h[2] / h[3], epsilon = 1e-9);
    }

    #[test]
    fn keyframe_cells_map_onto_their_own_pixels() {
        // Projecting a volume cell back into the keyframe's own image must
        // recover the pixel coordinate (plus the texel-center offset),
        // whatever the layer.
        let intrinsics = test_intrinsics();
        let pose = Pose::new(
            nalgebra::Matrix3::identity(),
            Vec3d::new(0.2, -0.1, 0.05),
        )
        .unwrap();
        let geom = VolumeGeometry::new(&intrinsics, &pose, 0.015, 0.0, 32).unwrap();
        let m = geom.image_from_volume(&intrinsics, &pose).unwrap();
        for &layer in &[0.0, 7.0, 31.0] {
            let h = m * Vector4::new(20.0, 11.0, layer, 1.0);
            assert_abs_diff_eq!(20.5, h[0] / h[2], epsilon = 1e-6);
            assert_abs_diff_eq!(11.5, h[1] / h[2], epsilon = 1e-6);
        }
    }

    #[test]
    fn singular_projection_is_reported() {
        let degenerate = Intrinsics {
            principal_point: (32.0, 16.0),
            focals: (0.0, 100.0),
            skew: 0.0,
        };
        let geom = VolumeGeometry::new(&degenerate, &Pose::identity(), 0.5, 0.1, 5);
        // The volume projection itself is rank deficient, which surfaces
        // when building the volume-to-image chain.
        let geom = geom.unwrap();
        let result = geom.image_from_volume(&degenerate, &Pose::identity());
        assert!(matches!(result, Err(Error::SingularPose(_))));
    }

    #[test]
    fn single_layer_geometry_is_finite() {
        let geom =
            VolumeGeometry::new(&test_intrinsics(), &Pose::identity(), 0.5, 0.1, 1).unwrap();
        assert_eq!(0.0, geom.depth_step());
        assert!(geom.projection().iter().all(|v| v.is_finite()));
    }
}
