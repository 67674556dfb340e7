// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Interoperability conversions between the image and matrix types.

use image::{GrayImage, Luma, Rgb, RgbImage, RgbaImage};
use nalgebra::DMatrix;

use crate::misc::type_aliases::Float;

/// Convert an `u8` matrix into a `GrayImage`.
/// Inverse operation of `matrix_from_image`.
///
/// Performs a transposition to accomodate for the
/// column major matrix into the row major image.
#[allow(clippy::cast_possible_truncation)]
pub fn image_from_matrix(mat: &DMatrix<u8>) -> GrayImage {
    let (nb_rows, nb_cols) = mat.shape();
    let mut img_buf = GrayImage::new(nb_cols as u32, nb_rows as u32);
    for (x, y, pixel) in img_buf.enumerate_pixels_mut() {
        *pixel = Luma([mat[(y as usize, x as usize)]]);
    }
    img_buf
}

/// Convert a `GrayImage` into an `u8` matrix.
/// Inverse operation of `image_from_matrix`.
pub fn matrix_from_image(img: GrayImage) -> DMatrix<u8> {
    let (width, height) = img.dimensions();
    DMatrix::from_row_slice(height as usize, width as usize, &img.into_raw())
}

/// Convert a canonical RGBA frame into a color matrix with channels
/// normalized to [0, 1]. The alpha channel is dropped.
pub fn color_matrix_from_rgba(img: &RgbaImage) -> DMatrix<(Float, Float, Float)> {
    let (width, height) = img.dimensions();
    DMatrix::from_fn(height as usize, width as usize, |y, x| {
        let p = img.get_pixel(x as u32, y as u32).0;
        (
            Float::from(p[0]) / 255.0,
            Float::from(p[1]) / 255.0,
            Float::from(p[2]) / 255.0,
        )
    })
}

/// Convert a [0, 1] color matrix back into an `RgbImage`.
/// Values outside [0, 1] are clamped.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub fn rgb_from_color_matrix(mat: &DMatrix<(Float, Float, Float)>) -> RgbImage {
    let (nb_rows, nb_cols) = mat.shape();
    let mut img_buf = RgbImage::new(nb_cols as u32, nb_rows as u32);
    for (x, y, pixel) in img_buf.enumerate_pixels_mut() {
        let (r, g, b) = mat[(y as usize, x as usize)];
        let to_byte = |v: Float| (255.0 * v.max(0.0).min(1.0)).round() as u8;
        *pixel = Rgb([to_byte(r), to_byte(g), to_byte(b)]);
    }
    img_buf
}

/// Convert a `Float` matrix into a `GrayImage`, mapping the
/// `[min, max]` interval onto the 8 bit range. Used for visualization.
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::cast_sign_loss)]
pub fn gray_from_float_matrix(mat: &DMatrix<Float>, min: Float, max: Float) -> GrayImage {
    let span = if max > min { max - min } else { 1.0 };
    let (nb_rows, nb_cols) = mat.shape();
    let mut img_buf = GrayImage::new(nb_cols as u32, nb_rows as u32);
    for (x, y, pixel) in img_buf.enumerate_pixels_mut() {
        let v = (mat[(y as usize, x as usize)] - min) / span;
        *pixel = Luma([(255.0 * v.max(0.0).min(1.0)).round() as u8]);
    }
    img_buf
}

// TESTS #############################################################
