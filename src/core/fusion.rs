// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-cell fusion kernel contract and its software reference
//! implementation.
//!
//! For every volume cell `(x, y, layer)` a kernel projects the cell into
//! the incoming frame, samples it bilinearly with clamped edges and
//! normalized-float reads, measures the absolute photometric difference
//! against the keyframe reference color, and blends the result into the
//! running cost with the cumulative-average weight. Cells projecting
//! outside the frame are excluded from blending so an invalid sample can
//! never corrupt the running mean. Per pixel, the kernel maintains the
//! minimum cost over layers (`lo`), its layer (`lo_ind`) and a runner-up
//! bound at a different layer (`hi`).

use image::RgbaImage;

use crate::errors::Error;
use crate::misc::type_aliases::{Float, Mat3x4, Mat3x4d};

/// Denominator guard for the perspective divide.
const HOMOGENEOUS_EPSILON: Float = 1e-12;

/// Everything a kernel needs for one whole-volume dispatch.
pub struct FusionPass<'a> {
    /// Image rows, also the volume's y extent.
    pub rows: usize,
    /// Image columns, also the volume's x extent.
    pub cols: usize,
    /// Number of inverse-depth layers.
    pub layers: usize,
    /// Direct map from a volume cell to frame pixel coordinates.
    pub image_from_volume: Mat3x4d,
    /// Cumulative-average blending weight in (0, 1).
    pub weight: Float,
    /// The staged canonical RGBA frame to fuse.
    pub frame: &'a RgbaImage,
}

/// Host-side state of one cost volume store.
///
/// `cost` is laid out as `layers` planes of `rows * cols` values; the
/// bound trackers and the reference colors hold one entry per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionBuffers {
    /// Fused photometric cost, `layers * rows * cols` values.
    pub cost: Vec<Float>,
    /// Per-pixel minimum cost across layers.
    pub lo: Vec<Float>,
    /// Per-pixel runner-up cost bound, attained at a layer != `lo_ind`.
    pub hi: Vec<Float>,
    /// Layer index of the per-pixel minimum, stored as Float.
    pub lo_ind: Vec<Float>,
    /// Reference color per pixel, RGBA normalized to [0, 1].
    pub base: Vec<[Float; 4]>,
}

impl FusionBuffers {
    /// Allocate buffers for a volume of the given extent, every cost cell
    /// set to `initial_cost` and the bound trackers zeroed.
    pub fn new(rows: usize, cols: usize, layers: usize, initial_cost: Float) -> Self {
        let plane = rows * cols;
        Self {
            cost: vec![initial_cost; layers * plane],
            lo: vec![0.0; plane],
            hi: vec![0.0; plane],
            lo_ind: vec![0.0; plane],
            base: vec![[0.0; 4]; plane],
        }
    }
}

/// The compute boundary of frame fusion.
///
/// Implementations must honor the per-cell contract described in the
/// module documentation. `dispatch` may run asynchronously;
/// `synchronize` must complete all outstanding work and make the fused
/// results visible in the host buffers before returning.
pub trait FusionKernel {
    /// Fuse one frame into the volume.
    fn dispatch(&mut self, pass: &FusionPass, buffers: &mut FusionBuffers) -> Result<(), Error>;

    /// Wait for outstanding work and publish results into `buffers`.
    fn synchronize(&mut self, buffers: &mut FusionBuffers) -> Result<(), Error>;

    /// Clone the kernel for a copied store. Shared device resources stay
    /// shared; per-store device state is re-established lazily.
    fn boxed_clone(&self) -> Box<dyn FusionKernel>;
}

// SOFTWARE KERNEL #########################################

/// Synchronous host implementation of the fusion kernel contract.
///
/// This is the reference the GPU kernel is validated against; both walk
/// the volume one pixel at a time, looping over layers.
#[derive(Debug, Clone, Default)]
pub struct SoftwareKernel;

impl FusionKernel for SoftwareKernel {
    fn dispatch(&mut self, pass: &FusionPass, buffers: &mut FusionBuffers) -> Result<(), Error> {
        let m: Mat3x4 = pass.image_from_volume.cast::<Float>();
        let (rows, cols, layers) = (pass.rows, pass.cols, pass.layers);
        let plane = rows * cols;
        let w = pass.weight;

        for y in 0..rows {
            for x in 0..cols {
                let i = y * cols + x;
                let base = buffers.base[i];
                for l in 0..layers {
                    let idx = l * plane + i;
                    let (xf, yf, lf) = (x as Float, y as Float, l as Float);
                    let u_h = m[(0, 0)] * xf + m[(0, 1)] * yf + m[(0, 2)] * lf + m[(0, 3)];
                    let v_h = m[(1, 0)] * xf + m[(1, 1)] * yf + m[(1, 2)] * lf + m[(1, 3)];
                    let w_h = m[(2, 0)] * xf + m[(2, 1)] * yf + m[(2, 2)] * lf + m[(2, 3)];
                    if w_h.abs() <= HOMOGENEOUS_EPSILON {
                        continue;
                    }
                    let u = u_h / w_h;
                    let v = v_h / w_h;
                    if u < 0.0 || u >= cols as Float || v < 0.0 || v >= rows as Float {
                        // Out of bounds: excluded from blending.
                        continue;
                    }
                    let sample = sample_bilinear(pass.frame, u, v);
                    let err = ((sample[0] - base[0]).abs()
                        + (sample[1] - base[1]).abs()
                        + (sample[2] - base[2]).abs())
                        / 3.0;
                    buffers.cost[idx] = w * buffers.cost[idx] + (1.0 - w) * err;
                }
                update_bounds(buffers, i, plane, layers);
            }
        }
        Ok(())
    }

    fn synchronize(&mut self, _buffers: &mut FusionBuffers) -> Result<(), Error> {
        // Everything already ran on the host.
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn FusionKernel> {
        Box::new(self.clone())
    }
}

/// Rescan one pixel's cost column and refresh `lo`, `lo_ind` and `hi`.
fn update_bounds(buffers: &mut FusionBuffers, i: usize, plane: usize, layers: usize) {
    let mut lo = Float::INFINITY;
    let mut lo_layer = 0;
    for l in 0..layers {
        let c = buffers.cost[l * plane + i];
        if c < lo {
            lo = c;
            lo_layer = l;
        }
    }
    let mut hi = Float::INFINITY;
    for l in 0..layers {
        if l == lo_layer {
            continue;
        }
        let c = buffers.cost[l * plane + i];
        if c < hi {
            hi = c;
        }
    }
    buffers.lo[i] = lo;
    buffers.lo_ind[i] = lo_layer as Float;
    buffers.hi[i] = if layers > 1 { hi } else { lo };
}

/// Bilinear sample with clamped edges and normalized-float reads,
/// texel centers at half-integer coordinates.
pub fn sample_bilinear(img: &RgbaImage, u: Float, v: Float) -> [Float; 3] {
    let (width, height) = img.dimensions();
    let clamp = |x: i64, max: u32| x.max(0).min(i64::from(max) - 1) as u32;
    let x = u - 0.5;
    let y = v - 0.5;
    let x0 = x.floor();
    let y0 = y.floor();
    let tx = x - x0;
    let ty = y - y0;
    let x0i = clamp(x0 as i64, width);
    let x1i = clamp(x0 as i64 + 1, width);
    let y0i = clamp(y0 as i64, height);
    let y1i = clamp(y0 as i64 + 1, height);
    let fetch = |xi: u32, yi: u32| {
        let p = img.get_pixel(xi, yi).0;
        [
            Float::from(p[0]) / 255.0,
            Float::from(p[1]) / 255.0,
            Float::from(p[2]) / 255.0,
        ]
    };
    let p00 = fetch(x0i, y0i);
    let p10 = fetch(x1i, y0i);
    let p01 = fetch(x0i, y1i);
    let p11 = fetch(x1i, y1i);
    let mut out = [0.0; 3];
    for c in 0..3 {
        let top = (1.0 - tx) * p00[c] + tx * p10[c];
        let bottom = (1.0 - tx) * p01[c] + tx * p11[c];
        out[c] = (1.0 - ty) * top + ty * bottom;
    }
    out
}

// TESTS #############################################################
