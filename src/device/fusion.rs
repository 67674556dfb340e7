// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The GPU fusion kernel.
//!
//! One compute dispatch covers the whole volume; each invocation owns one
//! pixel column of the cost grid, mirroring the software kernel cell for
//! cell. Work is queued on dispatch and only made visible on the host by
//! `synchronize`, which is the store's completion wait.

use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::core::fusion::{FusionBuffers, FusionKernel, FusionPass};
use crate::device::context::{DeviceError, GpuContext};
use crate::device::texture::FrameTexture;
use crate::errors::Error;

/// Uniform block of one dispatch, laid out to match the WGSL struct.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct FusionParams {
    m0: [f32; 4],
    m1: [f32; 4],
    m2: [f32; 4],
    rows: u32,
    cols: u32,
    layers: u32,
    weight: f32,
}

/// Per-store device buffers, created lazily at the first dispatch and
/// rebuilt from the host buffers after a clone.
struct DeviceVolume {
    rows: usize,
    cols: usize,
    layers: usize,
    cost: wgpu::Buffer,
    lo: wgpu::Buffer,
    hi: wgpu::Buffer,
    lo_ind: wgpu::Buffer,
    uniform: wgpu::Buffer,
    staging: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// Device implementation of the fusion kernel contract.
///
/// The pipeline and device context are process-wide and shared between
/// kernels; the frame texture is shared between clones of one store; the
/// volume buffers belong to a single store.
pub struct GpuKernel {
    ctx: Arc<GpuContext>,
    pipeline: Arc<wgpu::ComputePipeline>,
    layout: Arc<wgpu::BindGroupLayout>,
    texture: Option<Arc<FrameTexture>>,
    volume: Option<DeviceVolume>,
    pending: bool,
}

impl GpuKernel {
    /// Build the fusion pipeline on an initialized device.
    pub fn new(ctx: Arc<GpuContext>) -> Self {
        let shader = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("fusion.wgsl"),
                source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/fusion.wgsl").into()),
            });

        let layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("fusion bind group layout"),
                entries: &[
                    uniform_entry(0),
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                    storage_entry(3, true),
                    storage_entry(4, false),
                    storage_entry(5, false),
                    storage_entry(6, false),
                    storage_entry(7, false),
                ],
            });

        let pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("fusion pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("fuse"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: "fuse",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        Self {
            ctx,
            pipeline: Arc::new(pipeline),
            layout: Arc::new(layout),
            texture: None,
            volume: None,
            pending: false,
        }
    }

    fn ensure_texture(&mut self, cols: u32, rows: u32) -> Arc<FrameTexture> {
        match &self.texture {
            Some(t) if t.extent() == (cols, rows) => t.clone(),
            _ => {
                let t = Arc::new(FrameTexture::new(&self.ctx, cols, rows));
                self.texture = Some(t.clone());
                t
            }
        }
    }
}

/// Create the per-store device buffers, seeded from the host buffers.
fn create_volume(
    ctx: &GpuContext,
    layout: &wgpu::BindGroupLayout,
    pass: &FusionPass,
    buffers: &FusionBuffers,
    texture: &FrameTexture,
) -> DeviceVolume {
    let device = &ctx.device;
    let plane_bytes = (pass.rows * pass.cols * 4) as u64;
    let cost_bytes = plane_bytes * pass.layers as u64;

    let init = |label, contents: &[f32], extra| {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(contents),
            usage: wgpu::BufferUsages::STORAGE | extra,
        })
    };
    let cost = init(
        "fusion cost",
        &buffers.cost,
        wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
    );
    let lo = init("fusion lo", &buffers.lo, wgpu::BufferUsages::COPY_SRC);
    let hi = init("fusion hi", &buffers.hi, wgpu::BufferUsages::COPY_SRC);
    let lo_ind = init("fusion lo_ind", &buffers.lo_ind, wgpu::BufferUsages::COPY_SRC);
    let base = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("fusion base"),
        contents: bytemuck::cast_slice(&buffers.base),
        usage: wgpu::BufferUsages::STORAGE,
    });
    let uniform = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("fusion params"),
        size: std::mem::size_of::<FusionParams>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("fusion staging"),
        size: cost_bytes + 3 * plane_bytes,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("fusion bind group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(&texture.sampler),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: base.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: cost.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: lo.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 6,
                resource: hi.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 7,
                resource: lo_ind.as_entire_binding(),
            },
        ],
    });

    DeviceVolume {
        rows: pass.rows,
        cols: pass.cols,
        layers: pass.layers,
        cost,
        lo,
        hi,
        lo_ind,
        uniform,
        staging,
        bind_group,
    }
}

impl FusionKernel for GpuKernel {
    fn dispatch(&mut self, pass: &FusionPass, buffers: &mut FusionBuffers) -> Result<(), Error> {
        let texture = self.ensure_texture(pass.cols as u32, pass.rows as u32);

        let stale = match &self.volume {
            Some(v) => (v.rows, v.cols, v.layers) != (pass.rows, pass.cols, pass.layers),
            None => true,
        };
        if stale {
            self.volume = None;
        }
        let (ctx, layout) = (&self.ctx, &self.layout);
        let volume = &*self
            .volume
            .get_or_insert_with(|| create_volume(ctx, layout, pass, buffers, &texture));

        texture.upload(&self.ctx, pass.frame);

        let m = &pass.image_from_volume;
        let row = |r: usize| {
            [
                m[(r, 0)] as f32,
                m[(r, 1)] as f32,
                m[(r, 2)] as f32,
                m[(r, 3)] as f32,
            ]
        };
        let params = FusionParams {
            m0: row(0),
            m1: row(1),
            m2: row(2),
            rows: pass.rows as u32,
            cols: pass.cols as u32,
            layers: pass.layers as u32,
            weight: pass.weight,
        };
        self.ctx
            .queue
            .write_buffer(&volume.uniform, 0, bytemuck::bytes_of(&params));

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fusion dispatch"),
            });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("fuse"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&self.pipeline);
            cpass.set_bind_group(0, &volume.bind_group, &[]);
            let groups_x = (pass.cols as u32 + 31) / 32;
            let groups_y = (pass.rows as u32 + 3) / 4;
            cpass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        self.pending = true;
        Ok(())
    }

    fn synchronize(&mut self, buffers: &mut FusionBuffers) -> Result<(), Error> {
        let volume = match &self.volume {
            Some(v) if self.pending => v,
            _ => return Ok(()),
        };
        let plane_bytes = (volume.rows * volume.cols * 4) as u64;
        let cost_bytes = plane_bytes * volume.layers as u64;

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fusion readback"),
            });
        encoder.copy_buffer_to_buffer(&volume.cost, 0, &volume.staging, 0, cost_bytes);
        encoder.copy_buffer_to_buffer(&volume.lo, 0, &volume.staging, cost_bytes, plane_bytes);
        encoder.copy_buffer_to_buffer(
            &volume.hi,
            0,
            &volume.staging,
            cost_bytes + plane_bytes,
            plane_bytes,
        );
        encoder.copy_buffer_to_buffer(
            &volume.lo_ind,
            0,
            &volume.staging,
            cost_bytes + 2 * plane_bytes,
            plane_bytes,
        );
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let slice = volume.staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.ctx.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| DeviceError::Readback("map callback dropped".to_string()))?
            .map_err(|e| DeviceError::Readback(e.to_string()))?;

        {
            let mapped = slice.get_mapped_range();
            let data: &[f32] = bytemuck::cast_slice(&mapped);
            let plane = volume.rows * volume.cols;
            let cost_len = plane * volume.layers;
            buffers.cost.copy_from_slice(&data[..cost_len]);
            buffers.lo.copy_from_slice(&data[cost_len..cost_len + plane]);
            buffers
                .hi
                .copy_from_slice(&data[cost_len + plane..cost_len + 2 * plane]);
            buffers
                .lo_ind
                .copy_from_slice(&data[cost_len + 2 * plane..cost_len + 3 * plane]);
        }
        volume.staging.unmap();
        self.pending = false;
        Ok(())
    }

    fn boxed_clone(&self) -> Box<dyn FusionKernel> {
        // The pipeline and frame texture stay shared; the cloned store
        // re-creates its volume buffers from its own host buffers at the
        // next dispatch.
        Box::new(Self {
            ctx: self.ctx.clone(),
            pipeline: self.pipeline.clone(),
            layout: self.layout.clone(),
            texture: self.texture.clone(),
            volume: None,
            pending: false,
        })
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

// TESTS #############################################################
