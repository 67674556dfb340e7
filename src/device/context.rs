// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Compute device initialization.
//!
//! One [`GpuContext`] is created per process and shared by every kernel
//! through an `Arc`. Creation is expensive (instance plus device
//! initialization); everything after that clones handles.

use thiserror::Error;
use tracing::info;

/// Errors of device initialization and host readback.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No compute-capable adapter was found on this machine.
    #[error("no compute adapter available")]
    NoAdapter,
    /// The adapter refused the device request.
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),
    /// Mapping a readback buffer on the host failed.
    #[error("device readback failed: {0}")]
    Readback(String),
}

/// Device, queue and adapter description of one compute device.
///
/// Field order matters: the instance is declared last so it outlives the
/// device and queue during drop.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
    _instance: wgpu::Instance,
}

impl GpuContext {
    /// Initialize the preferred adapter of the primary backend.
    ///
    /// Fails with `DeviceError::NoAdapter` when only unusable adapters
    /// exist, e.g. in a headless CI container.
    pub fn new() -> Result<Self, DeviceError> {
        pollster::block_on(Self::init_async())
    }

    async fn init_async() -> Result<Self, DeviceError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or(DeviceError::NoAdapter)?;
        let adapter_name = adapter.get_info().name;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("dense-stereo"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;
        info!(adapter = %adapter_name, "compute device initialized");
        Ok(Self {
            device,
            queue,
            adapter_name,
            _instance: instance,
        })
    }
}
