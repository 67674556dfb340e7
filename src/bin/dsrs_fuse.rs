// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fuse a synthetic translating sequence into a cost volume and write the
//! recovered inverse-depth map and a reprojection check to disk.

use image::DynamicImage;
use nalgebra::Vector4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::{env, error::Error, fs, path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

use dense_stereo_rs::core::camera::{Intrinsics, Pose};
use dense_stereo_rs::core::fusion::sample_bilinear;
use dense_stereo_rs::core::reproject::{self, depth_carrying_transform};
use dense_stereo_rs::core::volume::{CostVolume, VolumeConfig};
use dense_stereo_rs::device::context::GpuContext;
use dense_stereo_rs::device::fusion::GpuKernel;
use dense_stereo_rs::misc::interop;
use dense_stereo_rs::misc::type_aliases::Float;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args: Vec<String> = env::args().collect();
    if let Err(error) = my_run(&args) {
        eprintln!("{:?}", error);
        std::process::exit(1);
    }
}

const USAGE: &str = "Usage: ./dsrs_fuse out_dir [--gpu]";

const COLS: u32 = 128;
const ROWS: u32 = 96;
const NB_FRAMES: usize = 8;
const PLANE_INVERSE_DEPTH: Float = 0.5;

fn my_run(args: &[String]) -> Result<(), Box<dyn Error>> {
    let valid_args = check_args(args)?;
    fs::create_dir_all(&valid_args.out_dir)?;

    let intrinsics = Intrinsics {
        principal_point: (f64::from(COLS) / 2.0 - 0.5, f64::from(ROWS) / 2.0 - 0.5),
        focals: (120.0, 120.0),
        skew: 0.0,
    };
    let config = VolumeConfig {
        layers: 32,
        near: 0.8,
        far: 0.1,
        initial_cost: 3.0,
        initial_weight: 0.001,
    };

    // A fronto-parallel textured plane observed by a camera translating
    // along x. Every frame is an exact warp of the keyframe, so the
    // minimum-cost layer should land on the plane's inverse depth.
    let reference = noise_image(COLS, ROWS);
    let reference_pose = Pose::identity();

    let kernel: Box<dyn dense_stereo_rs::core::fusion::FusionKernel> = if valid_args.gpu {
        let ctx = Arc::new(GpuContext::new()?);
        Box::new(GpuKernel::new(ctx))
    } else {
        Box::new(dense_stereo_rs::core::fusion::SoftwareKernel)
    };
    let mut volume = CostVolume::with_kernel(
        &reference,
        0,
        &config,
        &reference_pose,
        &intrinsics,
        kernel,
    )?;

    let mut last_pose = reference_pose.clone();
    let mut last_frame = volume.reference().clone();
    for k in 1..=NB_FRAMES {
        let pose = translated_x(0.01 * k as f64);
        let frame = synthesize_view(volume.reference(), &intrinsics, &pose)?;
        volume.update(&DynamicImage::ImageRgba8(frame.clone()), &pose)?;
        last_pose = pose;
        last_frame = frame;
    }
    volume.synchronize()?;

    // Raw inverse-depth estimate of the fused volume, next to the gray
    // keyframe it was estimated for.
    let depth = volume.inverse_depth_map();
    let depth_img =
        interop::gray_from_float_matrix(&depth, volume.geometry().far(), volume.geometry().near());
    depth_img.save(valid_args.out_dir.join("inverse_depth.png"))?;
    interop::image_from_matrix(volume.reference_gray())
        .save(valid_args.out_dir.join("reference_gray.png"))?;

    // Reprojection check of the estimate against the last frame.
    let result = reproject::reproject(
        volume.reference(),
        &last_frame,
        &depth,
        &reference_pose,
        &last_pose,
        &intrinsics,
    )?;
    interop::rgb_from_color_matrix(&result.validated)
        .save(valid_args.out_dir.join("validated.png"))?;
    interop::rgb_from_color_matrix(&result.forward_rendered)
        .save(valid_args.out_dir.join("forward_rendered.png"))?;

    let accepted = result
        .geometric_mask
        .iter()
        .filter(|&&m| m)
        .count();
    println!(
        "fused {} frames, {} / {} pixels pass the geometric check",
        volume.fused_frames(),
        accepted,
        (ROWS * COLS) as usize
    );
    Ok(())
}

struct Args {
    out_dir: PathBuf,
    gpu: bool,
}

/// Verify that command line arguments are correct.
fn check_args(args: &[String]) -> Result<Args, String> {
    match args {
        [_, out_dir] => Ok(Args {
            out_dir: PathBuf::from(out_dir),
            gpu: false,
        }),
        [_, out_dir, flag] if flag == "--gpu" => Ok(Args {
            out_dir: PathBuf::from(out_dir),
            gpu: true,
        }),
        _ => {
            eprintln!("{}", USAGE);
            Err("Invalid arguments".to_string())
        }
    }
}

/// A smooth random texture, unambiguous under photometric matching.
fn noise_image(width: u32, height: u32) -> DynamicImage {
    let mut rng = StdRng::seed_from_u64(42);
    let mut img = image::GrayImage::new(width, height);
    for pixel in img.pixels_mut() {
        *pixel = image::Luma([rng.gen()]);
    }
    DynamicImage::ImageLuma8(img).blur(1.5)
}

fn translated_x(tx: f64) -> Pose {
    Pose::new(nalgebra::Matrix3::identity(), nalgebra::Vector3::new(tx, 0.0, 0.0))
        .expect("identity rotation is valid")
}

/// Render the plane as seen from `pose` by pulling colors back from the
/// keyframe through the depth-carrying transform.
fn synthesize_view(
    reference: &image::RgbaImage,
    intrinsics: &Intrinsics,
    pose: &Pose,
) -> Result<image::RgbaImage, Box<dyn Error>> {
    let backward = depth_carrying_transform(intrinsics, pose, &Pose::identity())?;
    let mut img = image::RgbaImage::new(reference.width(), reference.height());
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let h = backward
            * Vector4::new(
                f64::from(x),
                f64::from(y),
                f64::from(PLANE_INVERSE_DEPTH),
                1.0,
            );
        let (u, v) = ((h[0] / h[2]) as Float, (h[1] / h[2]) as Float);
        let rgb = sample_bilinear(reference, u + 0.5, v + 0.5);
        let to_byte = |c: Float| (255.0 * c.max(0.0).min(1.0)).round() as u8;
        *pixel = image::Rgba([to_byte(rgb[0]), to_byte(rgb[1]), to_byte(rgb[2]), 255]);
    }
    Ok(img)
}
