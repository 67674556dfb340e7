// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-keyframe cost volume store and its frame-fusion driver.
//!
//! A store is created once per keyframe selection, mutated once per
//! incoming frame via [`CostVolume::update`], and discarded or replaced at
//! the next keyframe swap. Fusion itself runs behind the
//! [`FusionKernel`](crate::core::fusion::FusionKernel) boundary; with the
//! GPU kernel, work is ordered on the store's execution stream and
//! [`CostVolume::synchronize`] is the explicit completion wait required
//! before reading fused results on the host.

use image::{DynamicImage, RgbaImage};
use nalgebra::DMatrix;
use tracing::{debug, info};

use crate::core::camera::{Intrinsics, Pose};
use crate::core::fusion::{FusionBuffers, FusionKernel, FusionPass, SoftwareKernel};
use crate::core::geometry::VolumeGeometry;
use crate::errors::Error;
use crate::misc::interop;
use crate::misc::type_aliases::Float;

/// Identifier of the keyframe a store was built around.
pub type FrameId = u32;

/// Scalar configuration of a cost volume.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeConfig {
    /// Number of inverse-depth layers.
    pub layers: usize,
    /// Near plane, in inverse depth (largest inverse depth).
    pub near: Float,
    /// Far plane, in inverse depth.
    pub far: Float,
    /// Initial value of every cost cell.
    pub initial_cost: Float,
    /// Virtual prior frame count seeding the fusion weight.
    pub initial_weight: Float,
}

/// Fused per-pixel cost over inverse-depth layers for one keyframe.
pub struct CostVolume {
    frame_id: FrameId,
    rows: usize,
    cols: usize,
    geometry: VolumeGeometry,
    intrinsics: Intrinsics,
    initial_weight: Float,
    reference: RgbaImage,
    reference_gray: DMatrix<u8>,
    buffers: FusionBuffers,
    fused_frames: u32,
    kernel: Box<dyn FusionKernel>,
}

impl CostVolume {
    /// Build a store around a keyframe image, fusing on the software
    /// kernel. See [`CostVolume::with_kernel`] for the GPU path.
    pub fn new(
        image: &DynamicImage,
        frame_id: FrameId,
        config: &VolumeConfig,
        pose: &Pose,
        intrinsics: &Intrinsics,
    ) -> Result<Self, Error> {
        Self::with_kernel(
            image,
            frame_id,
            config,
            pose,
            intrinsics,
            Box::new(SoftwareKernel),
        )
    }

    /// Build a store around a keyframe image with an explicit fusion
    /// kernel.
    ///
    /// Fails with `Error::DimensionMismatch` unless rows and columns are
    /// multiples of 32 with at least 64 columns (the kernel tiling
    /// constraint), and with the staging errors of
    /// [`stage_rgba`] for unsupported keyframe formats.
    pub fn with_kernel(
        image: &DynamicImage,
        frame_id: FrameId,
        config: &VolumeConfig,
        pose: &Pose,
        intrinsics: &Intrinsics,
        kernel: Box<dyn FusionKernel>,
    ) -> Result<Self, Error> {
        let reference = stage_rgba(image)?;
        let rows = reference.height() as usize;
        let cols = reference.width() as usize;
        if rows % 32 != 0 || cols % 32 != 0 || cols < 64 {
            return Err(Error::DimensionMismatch(format!(
                "image extent {}x{} violates the tiling constraint \
                 (rows and cols multiples of 32, cols >= 64)",
                rows, cols
            )));
        }
        let geometry = VolumeGeometry::new(intrinsics, pose, config.near, config.far, config.layers)?;

        let mut buffers = FusionBuffers::new(rows, cols, config.layers, config.initial_cost);
        for (b, pixel) in buffers.base.iter_mut().zip(reference.pixels()) {
            let p = pixel.0;
            *b = [
                Float::from(p[0]) / 255.0,
                Float::from(p[1]) / 255.0,
                Float::from(p[2]) / 255.0,
                Float::from(p[3]) / 255.0,
            ];
        }
        let reference_gray = interop::matrix_from_image(
            DynamicImage::ImageRgba8(reference.clone()).to_luma8(),
        );

        info!(
            frame_id,
            rows,
            cols,
            layers = config.layers,
            "cost volume store created"
        );
        Ok(Self {
            frame_id,
            rows,
            cols,
            geometry,
            intrinsics: intrinsics.clone(),
            initial_weight: config.initial_weight,
            reference,
            reference_gray,
            buffers,
            fused_frames: 0,
            kernel,
        })
    }

    /// Fuse one posed frame into the volume.
    ///
    /// The frame is normalized to the canonical contiguous RGBA
    /// representation, the cell-to-frame projection is solved once, and
    /// the kernel is dispatched over the whole volume. The fused frame
    /// counter increments even when every cell projected out of bounds.
    pub fn update(&mut self, frame: &DynamicImage, pose: &Pose) -> Result<(), Error> {
        let staged = stage_rgba(frame)?;
        if staged.dimensions() != self.reference.dimensions() {
            return Err(Error::DimensionMismatch(format!(
                "frame extent {}x{} does not match the store extent {}x{}",
                staged.height(),
                staged.width(),
                self.rows,
                self.cols
            )));
        }
        let image_from_volume = self.geometry.image_from_volume(&self.intrinsics, pose)?;
        let weight = fusion_weight(self.fused_frames, self.initial_weight);

        let pass = FusionPass {
            rows: self.rows,
            cols: self.cols,
            layers: self.geometry.layers(),
            image_from_volume,
            weight,
            frame: &staged,
        };
        self.kernel.dispatch(&pass, &mut self.buffers)?;
        self.fused_frames += 1;
        debug!(
            frame_id = self.frame_id,
            fused = self.fused_frames,
            weight,
            "frame fused"
        );
        Ok(())
    }

    /// Wait for outstanding device work and publish fused results into the
    /// host buffers. A no-op on the software kernel.
    pub fn synchronize(&mut self) -> Result<(), Error> {
        self.kernel.synchronize(&mut self.buffers)
    }

    /// Keyframe identifier.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Image rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Image columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Depth discretization and combined projection of this keyframe.
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Number of frames fused so far.
    pub fn fused_frames(&self) -> u32 {
        self.fused_frames
    }

    /// The whole cost grid, `layers` planes of `rows * cols` values.
    pub fn cost(&self) -> &[Float] {
        &self.buffers.cost
    }

    /// One cost plane.
    pub fn cost_layer(&self, layer: usize) -> &[Float] {
        let plane = self.rows * self.cols;
        &self.buffers.cost[layer * plane..(layer + 1) * plane]
    }

    /// Per-pixel minimum cost across layers.
    pub fn lo(&self) -> &[Float] {
        &self.buffers.lo
    }

    /// Per-pixel runner-up cost bound.
    pub fn hi(&self) -> &[Float] {
        &self.buffers.hi
    }

    /// Per-pixel layer index of the minimum cost.
    pub fn lo_ind(&self) -> &[Float] {
        &self.buffers.lo_ind
    }

    /// Canonical RGBA reference image of the keyframe.
    pub fn reference(&self) -> &RgbaImage {
        &self.reference
    }

    /// Grayscale reference image of the keyframe.
    pub fn reference_gray(&self) -> &DMatrix<u8> {
        &self.reference_gray
    }

    /// Inverse depth at the per-pixel minimum-cost layer.
    ///
    /// This is the raw (unregularized) depth estimate the external
    /// optimizer starts from.
    pub fn inverse_depth_map(&self) -> DMatrix<Float> {
        DMatrix::from_fn(self.rows, self.cols, |r, c| {
            let layer = self.buffers.lo_ind[r * self.cols + c];
            self.geometry.inverse_depth_of_layer(layer)
        })
    }
}

impl Clone for CostVolume {
    /// Value-style copy. Host buffers are deep-copied; the device texture
    /// behind a GPU kernel stays shared and is released when the last
    /// owner drops. Synchronize a store before cloning it while device
    /// work may still be in flight.
    fn clone(&self) -> Self {
        Self {
            frame_id: self.frame_id,
            rows: self.rows,
            cols: self.cols,
            geometry: self.geometry.clone(),
            intrinsics: self.intrinsics.clone(),
            initial_weight: self.initial_weight,
            reference: self.reference.clone(),
            reference_gray: self.reference_gray.clone(),
            buffers: self.buffers.clone(),
            fused_frames: self.fused_frames,
            kernel: self.kernel.boxed_clone(),
        }
    }
}

/// The cumulative-average blending weight.
///
/// `w = (n + initial) / (n + initial + 1)` approaches 1 as the fused
/// frame count grows, so each new observation contributes a shrinking
/// increment: an online mean without per-frame history.
pub fn fusion_weight(fused_frames: u32, initial_weight: Float) -> Float {
    let n = fused_frames as Float + initial_weight;
    n / (n + 1.0)
}

/// Normalize a frame to the canonical contiguous 4-channel 8-bit
/// representation.
///
/// Accepted inputs are 1, 3 or 4 channel images: gray and RGB inputs
/// gain channels, 16-bit samples are rescaled to the 8-bit range, float
/// samples are scaled by 255. Fails with `Error::UnsupportedFormat` for
/// any other channel/depth combination.
pub fn stage_rgba(image: &DynamicImage) -> Result<RgbaImage, Error> {
    match image {
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageRgba8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_)
        | DynamicImage::ImageRgb32F(_)
        | DynamicImage::ImageRgba32F(_) => Ok(image.to_rgba8()),
        other => Err(Error::UnsupportedFormat(format!("{:?}", other.color()))),
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use approx::assert_abs_diff_eq;
    use image::{GrayImage, Luma, Rgba, RgbaImage};
    use quickcheck::TestResult;

    const EPSILON: Float = 1e-5;

    fn test_intrinsics() -> Intrinsics {
        Intrinsics {
            principal_point: (31.5, 15.5),
            focals: (100.0, 100.0),
            skew: 0.0,
        }
    }

    fn test_config() -> VolumeConfig {
        VolumeConfig {
            layers: 32,
            near: 0.015,
            far: 0.0,
            initial_cost: 3.0,
            initial_weight: 0.001,
        }
    }

    /// Horizontal linear ramp, exact under bilinear interpolation.
    fn ramp_image(width: u32, height: u32, shift: f64) -> DynamicImage {
        let mut img = RgbaImage::new(width, height);
        for (x, _, pixel) in img.enumerate_pixels_mut() {
            let v = (4.0 * (f64::from(x) - shift)).max(0.0).min(255.0);
            let v = v.round() as u8;
            *pixel = Rgba([v, v, v, 255]);
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn construction_rejects_bad_extents() {
        let config = test_config();
        let pose = Pose::identity();
        let intrinsics = test_intrinsics();
        for &(w, h) in &[(60, 32), (64, 30), (32, 32), (65, 32)] {
            let img = DynamicImage::ImageRgba8(RgbaImage::new(w, h));
            let result = CostVolume::new(&img, 0, &config, &pose, &intrinsics);
            assert!(
                matches!(result, Err(Error::DimensionMismatch(_))),
                "extent {}x{} should be rejected",
                w,
                h
            );
        }
        // 64x32 satisfies the tiling constraint.
        let img = DynamicImage::ImageRgba8(RgbaImage::new(64, 32));
        assert!(CostVolume::new(&img, 0, &config, &pose, &intrinsics).is_ok());
    }

    #[test]
    fn fresh_store_holds_initial_cost_everywhere() {
        let img = ramp_image(64, 32, 0.0);
        let volume =
            CostVolume::new(&img, 7, &test_config(), &Pose::identity(), &test_intrinsics())
                .unwrap();
        assert_eq!(0, volume.fused_frames());
        assert_eq!(7, volume.frame_id());
        assert_eq!(32 * 64 * 32, volume.cost().len());
        assert!(volume.cost().iter().all(|&c| c == 3.0));
        assert!(volume.lo().iter().all(|&v| v == 0.0));
        assert!(volume.hi().iter().all(|&v| v == 0.0));
        assert!(volume.lo_ind().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn out_of_bounds_frame_is_a_counted_no_op() {
        let img = ramp_image(64, 32, 0.0);
        let mut volume =
            CostVolume::new(&img, 0, &test_config(), &Pose::identity(), &test_intrinsics())
                .unwrap();
        // A pose so far to the side that every cell projects outside.
        let away = Pose::new(nalgebra::Matrix3::identity(), nalgebra::Vector3::new(1.0e6, 0.0, 0.0))
            .unwrap();
        volume.update(&img, &away).unwrap();
        volume.synchronize().unwrap();
        assert_eq!(1, volume.fused_frames());
        assert!(volume.cost().iter().all(|&c| c == 3.0));
    }

    #[test]
    fn mismatched_frame_extent_is_rejected_before_mutation() {
        let img = ramp_image(64, 32, 0.0);
        let mut volume =
            CostVolume::new(&img, 0, &test_config(), &Pose::identity(), &test_intrinsics())
                .unwrap();
        let small = DynamicImage::ImageRgba8(RgbaImage::new(32, 32));
        let result = volume.update(&small, &Pose::identity());
        assert!(matches!(result, Err(Error::DimensionMismatch(_))));
        assert_eq!(0, volume.fused_frames());
    }

    #[test]
    fn weight_sequence_matches_closed_form() {
        assert_abs_diff_eq!(0.5, fusion_weight(0, 1.0), epsilon = EPSILON);
        assert_abs_diff_eq!(2.0 / 3.0, fusion_weight(1, 1.0), epsilon = EPSILON);
        assert_abs_diff_eq!(0.75, fusion_weight(2, 1.0), epsilon = EPSILON);
    }

    #[quickcheck_macros::quickcheck]
    fn weight_sequence_is_increasing_and_bounded(n: u8, initial_weight: Float) -> TestResult {
        if !(initial_weight > 0.0 && initial_weight < 100.0) {
            return TestResult::discard();
        }
        let n = u32::from(n);
        let w = fusion_weight(n, initial_weight);
        let w_next = fusion_weight(n + 1, initial_weight);
        TestResult::from_bool(w > 0.0 && w < 1.0 && w_next > w)
    }

    #[test]
    fn min_cost_layer_matches_projected_depth() {
        // A planar scene at the inverse depth of layer 16, rendered as a
        // linear ramp; the fused frame is the same plane seen from a
        // camera translated along x, i.e. the ramp shifted by
        // fx * tx * inverse_depth pixels.
        let config = test_config();
        let intrinsics = test_intrinsics();
        let reference = ramp_image(64, 32, 0.0);
        let mut volume =
            CostVolume::new(&reference, 0, &config, &Pose::identity(), &intrinsics).unwrap();

        let step = config.near / 31.0;
        let plane_inverse_depth = f64::from(16.0 * step);
        let tx = 10.0;
        let shift = 100.0 * tx * plane_inverse_depth;
        let frame = ramp_image(64, 32, shift);
        let frame_pose =
            Pose::new(nalgebra::Matrix3::identity(), nalgebra::Vector3::new(tx, 0.0, 0.0))
                .unwrap();
        volume.update(&frame, &frame_pose).unwrap();
        volume.synchronize().unwrap();

        for y in 8..24 {
            for x in 20..40 {
                let i = y * 64 + x;
                assert_abs_diff_eq!(16.0, volume.lo_ind()[i], epsilon = 0.5);
            }
        }
    }

    #[test]
    fn inverse_depth_map_follows_lo_ind() {
        let img = ramp_image(64, 32, 0.0);
        let volume =
            CostVolume::new(&img, 0, &test_config(), &Pose::identity(), &test_intrinsics())
                .unwrap();
        let map = volume.inverse_depth_map();
        let step = volume.geometry().depth_step();
        for r in 0..32 {
            for c in 0..64 {
                let expected = volume.lo_ind()[r * 64 + c] * step;
                assert_abs_diff_eq!(expected, map[(r, c)], epsilon = EPSILON);
            }
        }
    }

    #[test]
    fn staging_normalizes_supported_formats() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 2, Luma([128])));
        let staged = stage_rgba(&gray).unwrap();
        assert_eq!((4, 2), staged.dimensions());
        assert_eq!(&Rgba([128, 128, 128, 255]), staged.get_pixel(0, 0));

        let wide = DynamicImage::ImageLuma16(image::ImageBuffer::from_pixel(
            4,
            2,
            image::Luma([32768_u16]),
        ));
        let staged = stage_rgba(&wide).unwrap();
        assert_eq!(128, staged.get_pixel(0, 0).0[0]);

        let float = DynamicImage::ImageRgb32F(image::Rgb32FImage::from_pixel(
            4,
            2,
            image::Rgb([0.5, 0.25, 1.0]),
        ));
        let staged = stage_rgba(&float).unwrap();
        let p = staged.get_pixel(0, 0).0;
        assert!((i32::from(p[0]) - 128).abs() <= 1);
        assert!((i32::from(p[1]) - 64).abs() <= 1);
        assert_eq!(255, p[2]);
    }

    #[test]
    fn two_channel_frames_are_rejected() {
        let gray_alpha = DynamicImage::ImageLumaA8(image::ImageBuffer::from_pixel(
            4,
            2,
            image::LumaA([128, 255]),
        ));
        let result = stage_rgba(&gray_alpha);
        assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn cloned_store_fuses_independently() {
        let img = ramp_image(64, 32, 0.0);
        let mut volume =
            CostVolume::new(&img, 0, &test_config(), &Pose::identity(), &test_intrinsics())
                .unwrap();
        let mut copy = volume.clone();
        copy.update(&img, &Pose::identity()).unwrap();
        copy.synchronize().unwrap();
        assert_eq!(0, volume.fused_frames());
        assert_eq!(1, copy.fused_frames());
        volume.synchronize().unwrap();
        assert!(volume.cost().iter().all(|&c| c == 3.0));
    }
}
