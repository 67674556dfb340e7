// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Depth-carrying reprojection between posed views.
//!
//! Given a reference image with a per-pixel inverse-depth map and a
//! comparison image under another pose, this module warps pixels from one
//! view into the other, resolves occlusions with a z-buffer, and scores
//! the result with geometric and photometric consistency masks. The whole
//! chain runs through one 3x4 matrix consuming `(x, y, inverse_depth, 1)`,
//! so no per-pixel back-projection into world coordinates is needed.

use image::RgbaImage;
use itertools::iproduct;
use nalgebra::{DMatrix, Vector4};
use tracing::debug;

use crate::core::camera::{Intrinsics, Pose};
use crate::errors::Error;
use crate::misc::type_aliases::{Float, Mat3x4d};

/// Marks z-buffer cells no source pixel landed on.
pub const DEPTH_SENTINEL: Float = -9999.9;

/// Inverse-depth agreement bound of the geometric consistency mask.
pub const GEOMETRIC_EPSILON: Float = 0.001;

/// Gray-level error bound of the photometric consistency mask, on
/// intensities normalized to `[0, 1]`.
pub const PHOTOMETRIC_EPSILON: Float = 0.1;

const HOMOGENEOUS_EPSILON: f64 = 1e-12;

/// Occlusion-resolving scatter target: nearest inverse depth per cell and
/// the source pixel that produced it.
#[derive(Debug, Clone)]
pub struct ZBuffer {
    /// Nearest inverse depth landed on each cell, or [`DEPTH_SENTINEL`].
    pub depth: DMatrix<Float>,
    /// Source column of the winning pixel, or [`DEPTH_SENTINEL`].
    pub source_x: DMatrix<Float>,
    /// Source row of the winning pixel, or [`DEPTH_SENTINEL`].
    pub source_y: DMatrix<Float>,
}

/// Full output of one reprojection pass.
#[derive(Debug, Clone)]
pub struct Reprojection {
    /// Per-pixel target coordinates `(x, y)` in the comparison view, or
    /// sentinel coordinates where the transform degenerated.
    pub correspondence: DMatrix<(Float, Float)>,
    /// Comparison colors gathered at the correspondence, gated by the
    /// confidence and geometric masks.
    pub validated: DMatrix<(Float, Float, Float)>,
    /// Reference colors scattered through the z-buffer provenance.
    pub forward_rendered: DMatrix<(Float, Float, Float)>,
    /// Per-channel photometric confidence in `[0, 1]`.
    pub confidence: DMatrix<(Float, Float, Float)>,
    /// True where pulled-back and forward depths agree.
    pub geometric_mask: DMatrix<bool>,
    /// True where the gray-level error exceeds the photometric bound.
    pub photometric_mask: DMatrix<bool>,
    /// The occlusion buffer the masks were derived from.
    pub zbuffer: ZBuffer,
}

/// Solve the 3x4 matrix carrying `(x, y, inverse_depth, 1)` in the old
/// view to homogeneous pixel coordinates in the new view.
///
/// The chain conjugates the relative pose by the identity-padded camera
/// matrix; a column swap moves the inverse-depth input into the slot the
/// homogeneous chain expects. Dividing the first two outputs by the third
/// yields the target pixel. Fails with `Error::SingularPose` if either
/// the old pose or the camera matrix is not invertible.
pub fn depth_carrying_transform(
    intrinsics: &Intrinsics,
    old_pose: &Pose,
    new_pose: &Pose,
) -> Result<Mat3x4d, Error> {
    let k4 = intrinsics.matrix4();
    let k4_inv = k4
        .try_inverse()
        .ok_or_else(|| Error::SingularPose("camera matrix is not invertible".to_string()))?;
    let old_inv = old_pose
        .matrix()
        .try_inverse()
        .ok_or_else(|| Error::SingularPose("old pose is not invertible".to_string()))?;
    let mut g = k4 * new_pose.matrix() * old_inv * k4_inv;
    g.swap_columns(2, 3);
    Ok(g.fixed_view::<3, 4>(0, 0).into_owned())
}

/// Warp the reference view onto the comparison view and score the result.
///
/// `depth` holds *inverse* depth per reference pixel (larger is nearer).
/// Fails with `Error::DimensionMismatch` unless both images and the depth
/// map share one extent, and with `Error::SingularPose` on degenerate
/// poses or intrinsics.
pub fn reproject(
    reference: &RgbaImage,
    comparison: &RgbaImage,
    depth: &DMatrix<Float>,
    reference_pose: &Pose,
    comparison_pose: &Pose,
    intrinsics: &Intrinsics,
) -> Result<Reprojection, Error> {
    let (cols, rows) = (reference.width() as usize, reference.height() as usize);
    if comparison.dimensions() != reference.dimensions() {
        return Err(Error::DimensionMismatch(format!(
            "comparison extent {:?} does not match reference extent {:?}",
            comparison.dimensions(),
            reference.dimensions()
        )));
    }
    if depth.shape() != (rows, cols) {
        return Err(Error::DimensionMismatch(format!(
            "depth extent {:?} does not match image extent {:?}",
            depth.shape(),
            (rows, cols)
        )));
    }

    let forward = depth_carrying_transform(intrinsics, reference_pose, comparison_pose)?;

    // Forward correspondence field, reference pixel -> comparison pixel.
    let correspondence = DMatrix::from_fn(rows, cols, |r, c| {
        let h = forward * Vector4::new(c as f64, r as f64, f64::from(depth[(r, c)]), 1.0);
        if h[2].abs() < HOMOGENEOUS_EPSILON {
            (DEPTH_SENTINEL, DEPTH_SENTINEL)
        } else {
            ((h[0] / h[2]) as Float, (h[1] / h[2]) as Float)
        }
    });

    // Scatter into the z-buffer, keeping the nearest inverse depth and the
    // source pixel that produced it.
    let mut zbuffer = ZBuffer {
        depth: DMatrix::repeat(rows, cols, DEPTH_SENTINEL),
        source_x: DMatrix::repeat(rows, cols, DEPTH_SENTINEL),
        source_y: DMatrix::repeat(rows, cols, DEPTH_SENTINEL),
    };
    for (r, c) in iproduct!(0..rows, 0..cols) {
        let (u, v) = correspondence[(r, c)];
        let (tc, tr) = (u.round() as i64, v.round() as i64);
        if tc < 0 || tr < 0 || tc >= cols as i64 || tr >= rows as i64 {
            continue;
        }
        let (tr, tc) = (tr as usize, tc as usize);
        let d = depth[(r, c)];
        if d > zbuffer.depth[(tr, tc)] {
            zbuffer.depth[(tr, tc)] = d;
            zbuffer.source_x[(tr, tc)] = c as Float;
            zbuffer.source_y[(tr, tc)] = r as Float;
        }
    }

    // Pull the scattered depth back along the correspondence; a reference
    // pixel passes the geometric check when the winning depth at its
    // target cell agrees with its own, i.e. when it is not occluded.
    let geometric_mask = DMatrix::from_fn(rows, cols, |r, c| {
        let (u, v) = correspondence[(r, c)];
        let (tc, tr) = (u.round() as i64, v.round() as i64);
        let pulled = if tc < 0 || tr < 0 || tc >= cols as i64 || tr >= rows as i64 {
            0.0
        } else {
            let d = zbuffer.depth[(tr as usize, tc as usize)];
            if d == DEPTH_SENTINEL {
                0.0
            } else {
                d
            }
        };
        (pulled - depth[(r, c)]).abs() < GEOMETRIC_EPSILON
    });

    // Gather predicted colors and score them photometrically against the
    // reference.
    let mut photometric_mask = DMatrix::repeat(rows, cols, false);
    let mut confidence = DMatrix::repeat(rows, cols, (0.0, 0.0, 0.0));
    let mut validated = DMatrix::repeat(rows, cols, (0.0, 0.0, 0.0));
    for (r, c) in iproduct!(0..rows, 0..cols) {
        let (u, v) = correspondence[(r, c)];
        let (tc, tr) = (u.round() as i64, v.round() as i64);
        if tc < 0 || tr < 0 || tc >= cols as i64 || tr >= rows as i64 {
            continue;
        }
        let predicted = normalized_rgb(comparison, tc as u32, tr as u32);
        let observed = normalized_rgb(reference, c as u32, r as u32);
        // Absolute difference per channel, then gray: opposing channel
        // deltas must not cancel each other out.
        let gray_err = gray_level(
            (predicted.0 - observed.0).abs(),
            (predicted.1 - observed.1).abs(),
            (predicted.2 - observed.2).abs(),
        );
        let rejected = gray_err > PHOTOMETRIC_EPSILON;
        photometric_mask[(r, c)] = rejected;
        let conf = 1.0 - Float::sqrt(if rejected { 1.0 } else { 0.0 });
        confidence[(r, c)] = (conf, conf, conf);
        if !rejected && geometric_mask[(r, c)] {
            validated[(r, c)] = predicted;
        }
    }

    // Render the comparison view forward from the z-buffer provenance.
    let forward_rendered = DMatrix::from_fn(rows, cols, |r, c| {
        let sx = zbuffer.source_x[(r, c)];
        if sx == DEPTH_SENTINEL {
            (0.0, 0.0, 0.0)
        } else {
            normalized_rgb(reference, sx as u32, zbuffer.source_y[(r, c)] as u32)
        }
    });

    let rejected = photometric_mask.iter().filter(|&&m| m).count();
    debug!(rows, cols, rejected, "reprojection pass complete");

    Ok(Reprojection {
        correspondence,
        validated,
        forward_rendered,
        confidence,
        geometric_mask,
        photometric_mask,
        zbuffer,
    })
}

fn normalized_rgb(img: &RgbaImage, x: u32, y: u32) -> (Float, Float, Float) {
    let p = img.get_pixel(x, y).0;
    (
        Float::from(p[0]) / 255.0,
        Float::from(p[1]) / 255.0,
        Float::from(p[2]) / 255.0,
    )
}

/// Luma weighting of an RGB triple.
fn gray_level(r: Float, g: Float, b: Float) -> Float {
    0.299 * r + 0.587 * g + 0.114 * b
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::misc::type_aliases::{Mat3d, Vec3d};
    use approx::assert_abs_diff_eq;
    use image::Rgba;

    fn test_intrinsics() -> Intrinsics {
        Intrinsics {
            principal_point: (8.0, 4.0),
            focals: (10.0, 10.0),
            skew: 0.0,
        }
    }

    fn translated(tx: f64) -> Pose {
        Pose::new(Mat3d::identity(), Vec3d::new(tx, 0.0, 0.0)).unwrap()
    }

    fn checker_image(width: u32, height: u32) -> RgbaImage {
        let mut img = RgbaImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = if (x + y) % 2 == 0 { 200 } else { 40 };
            *pixel = Rgba([v, v, v, 255]);
        }
        img
    }

    #[test]
    fn planar_scene_round_trips_through_both_transforms() {
        let intrinsics = test_intrinsics();
        let old = Pose::identity();
        let new = translated(0.3);
        let forward = depth_carrying_transform(&intrinsics, &old, &new).unwrap();
        let backward = depth_carrying_transform(&intrinsics, &new, &old).unwrap();

        let inverse_depth = 0.5_f64;
        for &(x, y) in &[(3.0, 2.0), (10.0, 5.0), (0.0, 0.0)] {
            let h = forward * Vector4::new(x, y, inverse_depth, 1.0);
            let (u, v) = (h[0] / h[2], h[1] / h[2]);
            // Pure x translation shifts by fx * tx * inverse_depth.
            assert_abs_diff_eq!(x + 10.0 * 0.3 * inverse_depth, u, epsilon = 1e-9);
            assert_abs_diff_eq!(y, v, epsilon = 1e-9);

            // Pure translation leaves depth unchanged, so the backward
            // chain undoes the forward one with the same inverse depth.
            let b = backward * Vector4::new(u, v, inverse_depth, 1.0);
            assert_abs_diff_eq!(x, b[0] / b[2], epsilon = 1e-9);
            assert_abs_diff_eq!(y, b[1] / b[2], epsilon = 1e-9);
        }
    }

    #[test]
    fn singular_intrinsics_are_reported() {
        let degenerate = Intrinsics {
            principal_point: (8.0, 4.0),
            focals: (0.0, 10.0),
            skew: 0.0,
        };
        let result = depth_carrying_transform(&degenerate, &Pose::identity(), &translated(0.1));
        assert!(matches!(result, Err(Error::SingularPose(_))));
    }

    #[test]
    fn nearest_pixel_wins_the_zbuffer() {
        // fx * tx = 10: the pixel at x = 5 with inverse depth 0.2 and the
        // pixel at x = 3 with inverse depth 0.4 both land on column 7; the
        // nearer one (larger inverse depth) must win.
        let intrinsics = test_intrinsics();
        let reference = checker_image(16, 8);
        let comparison = checker_image(16, 8);
        let mut depth = DMatrix::repeat(8, 16, 0.0);
        depth[(2, 5)] = 0.2;
        depth[(2, 3)] = 0.4;
        let result = reproject(
            &reference,
            &comparison,
            &depth,
            &Pose::identity(),
            &translated(1.0),
            &intrinsics,
        )
        .unwrap();
        assert_abs_diff_eq!(0.4, result.zbuffer.depth[(2, 7)], epsilon = 1e-6);
        assert_abs_diff_eq!(3.0, result.zbuffer.source_x[(2, 7)], epsilon = 1e-6);
        assert_abs_diff_eq!(2.0, result.zbuffer.source_y[(2, 7)], epsilon = 1e-6);
    }

    #[test]
    fn identity_reprojection_validates_everywhere() {
        let intrinsics = test_intrinsics();
        let img = checker_image(16, 8);
        let depth = DMatrix::repeat(8, 16, 0.5);
        let result = reproject(
            &img,
            &img,
            &depth,
            &Pose::identity(),
            &Pose::identity(),
            &intrinsics,
        )
        .unwrap();
        for r in 0..8 {
            for c in 0..16 {
                let (u, v) = result.correspondence[(r, c)];
                assert_abs_diff_eq!(c as Float, u, epsilon = 1e-5);
                assert_abs_diff_eq!(r as Float, v, epsilon = 1e-5);
                assert!(result.geometric_mask[(r, c)]);
                assert!(!result.photometric_mask[(r, c)]);
                assert_eq!((1.0, 1.0, 1.0), result.confidence[(r, c)]);
                let expected = if (r + c) % 2 == 0 { 200.0 / 255.0 } else { 40.0 / 255.0 };
                let (vr, vg, vb) = result.validated[(r, c)];
                assert_abs_diff_eq!(expected, vr, epsilon = 1e-5);
                assert_abs_diff_eq!(expected, vg, epsilon = 1e-5);
                assert_abs_diff_eq!(expected, vb, epsilon = 1e-5);
                // Forward rendering scatters the same colors back.
                let (fr, _, _) = result.forward_rendered[(r, c)];
                assert_abs_diff_eq!(expected, fr, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn photometric_outlier_is_rejected_with_zero_confidence() {
        let intrinsics = test_intrinsics();
        let reference = checker_image(16, 8);
        let mut comparison = checker_image(16, 8);
        comparison.put_pixel(6, 3, Rgba([255, 255, 255, 255]));
        let depth = DMatrix::repeat(8, 16, 0.5);
        let result = reproject(
            &reference,
            &comparison,
            &depth,
            &Pose::identity(),
            &Pose::identity(),
            &intrinsics,
        )
        .unwrap();
        assert!(result.photometric_mask[(3, 6)]);
        assert_eq!((0.0, 0.0, 0.0), result.confidence[(3, 6)]);
        assert_eq!((0.0, 0.0, 0.0), result.validated[(3, 6)]);
        assert!(!result.photometric_mask[(3, 5)]);
    }

    #[test]
    fn chroma_opposed_outlier_is_rejected() {
        // Channel deltas of opposite sign (red up, green down) whose
        // luma-weighted *signed* sum is near zero, while the sum of
        // absolute differences is well above the photometric bound.
        let intrinsics = test_intrinsics();
        let mut reference = checker_image(16, 8);
        reference.put_pixel(6, 3, Rgba([102, 102, 102, 255]));
        let mut comparison = checker_image(16, 8);
        comparison.put_pixel(6, 3, Rgba([153, 76, 102, 255]));
        let depth = DMatrix::repeat(8, 16, 0.5);
        let result = reproject(
            &reference,
            &comparison,
            &depth,
            &Pose::identity(),
            &Pose::identity(),
            &intrinsics,
        )
        .unwrap();
        assert!(result.photometric_mask[(3, 6)]);
        assert_eq!((0.0, 0.0, 0.0), result.confidence[(3, 6)]);
        assert_eq!((0.0, 0.0, 0.0), result.validated[(3, 6)]);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let intrinsics = test_intrinsics();
        let reference = checker_image(16, 8);
        let comparison = checker_image(16, 8);
        let bad_depth = DMatrix::repeat(4, 16, 0.5);
        let result = reproject(
            &reference,
            &comparison,
            &bad_depth,
            &Pose::identity(),
            &Pose::identity(),
            &intrinsics,
        );
        assert!(matches!(result, Err(Error::DimensionMismatch(_))));

        let small = checker_image(8, 8);
        let depth = DMatrix::repeat(8, 16, 0.5);
        let result = reproject(
            &reference,
            &small,
            &depth,
            &Pose::identity(),
            &Pose::identity(),
            &intrinsics,
        );
        assert!(matches!(result, Err(Error::DimensionMismatch(_))));
    }
}
