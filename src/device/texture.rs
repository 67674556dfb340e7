// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The device-side frame texture sampled by the fusion kernel.

use image::RgbaImage;

use crate::device::context::GpuContext;

/// An RGBA texture holding the frame currently being fused, together
/// with the clamped bilinear sampler the kernel reads it through.
///
/// The texture is the one device resource shared between owners of a
/// store; wrap it in an `Arc` and let the last owner release it.
pub struct FrameTexture {
    texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
    size: wgpu::Extent3d,
}

impl FrameTexture {
    /// Allocate a texture for frames of the given extent.
    pub fn new(ctx: &GpuContext, cols: u32, rows: u32) -> Self {
        let size = wgpu::Extent3d {
            width: cols,
            height: rows,
            depth_or_array_layers: 1,
        };
        let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("fusion frame"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("fusion sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        Self {
            texture,
            view,
            sampler,
            size,
        }
    }

    /// Texture extent as `(cols, rows)`.
    pub fn extent(&self) -> (u32, u32) {
        (self.size.width, self.size.height)
    }

    /// Upload one frame. The image extent must match the texture extent.
    pub fn upload(&self, ctx: &GpuContext, frame: &RgbaImage) {
        ctx.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            frame.as_raw(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * self.size.width),
                rows_per_image: Some(self.size.height),
            },
            self.size,
        );
    }
}
