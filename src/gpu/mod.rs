//! wgpu backend.
//!
//! Runs the five step states as compute passes on a headless device. The
//! device is created without a surface; nothing here renders.

mod shaders;
mod spatial_gpu;

pub use shaders::{pipeline_wgsl, BINDINGS_WGSL};
pub use spatial_gpu::{GpuBackend, GridParams};

use crate::error::{CapacityError, GpuError};

/// Lanes per work group. Every kernel is declared with this size.
pub const WORKGROUP_SIZE: u32 = 128;

/// Headless device and queue.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: wgpu::AdapterInfo,
}

impl GpuContext {
    /// Request a high-performance adapter without a surface.
    pub async fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Using adapter {} ({:?}, {:?})",
            adapter_info.name,
            adapter_info.device_type,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("cellgrid device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        Ok(Self {
            device,
            queue,
            adapter_info,
        })
    }

    /// Blocking wrapper around [`GpuContext::new`].
    pub fn headless() -> Result<Self, GpuError> {
        pollster::block_on(Self::new())
    }

    /// Fail if a storage buffer of `size` bytes cannot be created and bound.
    pub fn check_storage(&self, label: &'static str, size: u64) -> Result<(), CapacityError> {
        check_storage_size(&self.device.limits(), label, size)
    }

    /// Fail if a uniform buffer of `size` bytes cannot be created.
    pub fn check_uniform(&self, label: &'static str, size: u64) -> Result<(), CapacityError> {
        check_uniform_size(&self.device.limits(), label, size)
    }

    /// Copy `size` bytes of `buffer` to the host. Blocks until done.
    ///
    /// `buffer` needs `COPY_SRC` usage. Everything submitted before the call
    /// completes first.
    pub fn read_buffer(&self, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<u8>, GpuError> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // Receiver outlives the poll below
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|e| GpuError::BufferMapping(e.to_string()))?
            .map_err(|e| GpuError::BufferMapping(e.to_string()))?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    /// Read the first `count` elements of a buffer of `T`.
    pub fn read_pod<T: bytemuck::Pod>(&self, buffer: &wgpu::Buffer, count: usize) -> Result<Vec<T>, GpuError> {
        let size = std::mem::size_of::<T>();
        let bytes = self.read_buffer(buffer, (count * size) as u64)?;
        // Mapped bytes carry no alignment guarantee for T
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }
}

/// Work-group grid covering `lanes` invocations.
///
/// Counts past the per-dimension limit spill into y; kernels recover the
/// flat index as `gid.x + gid.y * num_workgroups.x * WORKGROUP_SIZE`.
pub fn dispatch_size(lanes: u32, max_per_dimension: u32) -> (u32, u32) {
    let groups = lanes.div_ceil(WORKGROUP_SIZE);
    if groups <= max_per_dimension {
        (groups, 1)
    } else {
        let y = groups.div_ceil(max_per_dimension);
        (groups.div_ceil(y), y)
    }
}

/// Round `size` up to a multiple of `alignment`.
#[inline]
pub(crate) fn align_to(size: u64, alignment: u64) -> u64 {
    size.div_ceil(alignment) * alignment
}

/// Storage buffers are bounded by both the buffer and the binding limit.
pub fn check_storage_size(
    limits: &wgpu::Limits,
    label: &'static str,
    size: u64,
) -> Result<(), CapacityError> {
    let limit = limits
        .max_buffer_size
        .min(limits.max_storage_buffer_binding_size as u64);
    check_limit(label, size, limit)
}

/// Uniform buffers are bounded by the buffer size limit only.
pub fn check_uniform_size(
    limits: &wgpu::Limits,
    label: &'static str,
    size: u64,
) -> Result<(), CapacityError> {
    check_limit(label, size, limits.max_buffer_size)
}

fn check_limit(label: &'static str, size: u64, limit: u64) -> Result<(), CapacityError> {
    if size > limit {
        return Err(CapacityError::BufferTooLarge {
            label,
            requested: size,
            limit,
        });
    }
    Ok(())
}
