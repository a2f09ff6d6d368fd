#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! wgpu dispatch backend.
//!
//! One adapter is opened per run. `start_search` builds the kernel with the
//! batch geometry bound in and uploads the job constants; every
//! `continue_search` writes the batch start, launches the grid and blocks on
//! the result readback.

pub mod kernel;


use anyhow::{anyhow, Result};
use engine_cpu::{BatchGeometry, SearchBackend};
use futures::executor::block_on;
use kernel::{BatchParams, JobParams, SearchResult};
use pow_core::{JobContext, MessageTemplate, NonceSlot, Target};
use std::path::PathBuf;
use wgpu::util::DeviceExt;

/// Largest number of nonces one batch may cover; in-batch offsets are u32.
pub const MAX_BATCH_SIZE: u64 = 1 << 32;

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no GPU adapter for platform {platform:?} device {device} ({available} adapter(s) found)")]
    NoAdapter {
        platform: Option<usize>,
        device: usize,
        available: usize,
    },

    #[error("platform {platform} device {device}: failed to open device: {source}")]
    RequestDevice {
        platform: usize,
        device: usize,
        #[source]
        source: wgpu::RequestDeviceError,
    },

    #[error("failed to read kernel {}: {source}", path.display())]
    KernelRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("platform {platform} device {device}: failed to build kernel {kernel}: {message}")]
    KernelBuild {
        platform: usize,
        device: usize,
        kernel: String,
        message: String,
    },

    #[error("unsupported geometry: {0}")]
    Geometry(String),

    #[error("platform {platform} device {device}: {message}")]
    Device {
        platform: usize,
        device: usize,
        message: String,
    },
}

/// Which adapter to open and how to build the kernel.
#[derive(Clone, Debug, Default)]
pub struct GpuConfig {
    /// Platform index (distinct wgpu backends in enumeration order). `None`
    /// selects the first platform that has an adapter.
    pub platform: Option<usize>,
    /// Adapter index within the platform.
    pub device: usize,
    /// Kernel source override; the built-in kernel when `None`.
    pub kernel: Option<PathBuf>,
}

impl GpuConfig {
    fn kernel_name(&self) -> String {
        self.kernel
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<built-in>".to_string())
    }
}

/// Per-search device state created by `start_search`.
struct GpuJob {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    // Bound through `bind_group`; kept so their lifetime is explicit.
    _job_buffer: wgpu::Buffer,
    _words_buffer: wgpu::Buffer,
    batch_buffer: wgpu::Buffer,
    result_buffer: wgpu::Buffer,
    staging_buffer: wgpu::Buffer,
    workgroups: (u32, u32),
}

pub struct GpuBackend {
    config: GpuConfig,
    platform: usize,
    info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    device: wgpu::Device,
    queue: wgpu::Queue,
    job: Option<GpuJob>,
}

/// Group adapters into platforms: one per distinct backend, in the order the
/// backends first appear.
fn platforms(adapters: &[wgpu::Adapter]) -> Vec<wgpu::Backend> {
    let mut out = Vec::new();
    for adapter in adapters {
        let backend = adapter.get_info().backend;
        if !out.contains(&backend) {
            out.push(backend);
        }
    }
    out
}

/// Split `grid_size` lanes into a 2-D dispatch of `local_size`-wide groups.
fn dispatch_shape(grid_size: u64, local_size: u32, max_per_dim: u32) -> Result<(u32, u32), GpuError> {
    let groups = grid_size.div_ceil(local_size as u64);
    let x = groups.min(max_per_dim as u64);
    let y = groups.div_ceil(x);
    if y > max_per_dim as u64 {
        return Err(GpuError::Geometry(format!(
            "{grid_size} lanes need {groups} workgroups of {local_size}, more than {max_per_dim}^2"
        )));
    }
    if x * y * local_size as u64 > MAX_BATCH_SIZE {
        return Err(GpuError::Geometry(format!(
            "dispatch of {x}x{y} workgroups of {local_size} exceeds 2^32 lanes"
        )));
    }
    Ok((x as u32, y as u32))
}

/// Device-side limits on a batch geometry.
fn check_geometry(geometry: &BatchGeometry, limits: &wgpu::Limits) -> Result<(u32, u32), GpuError> {
    let batch = geometry.batch_size();
    if batch > MAX_BATCH_SIZE {
        return Err(GpuError::Geometry(format!(
            "batch of {batch} nonces exceeds 2^32"
        )));
    }
    if geometry.grid_size > u32::MAX as u64 || geometry.lanes_per_item > u32::MAX as u64 {
        return Err(GpuError::Geometry(format!(
            "grid size {} and work set {} must each fit in 32 bits",
            geometry.grid_size, geometry.lanes_per_item
        )));
    }
    let max_local = limits
        .max_compute_workgroup_size_x
        .min(limits.max_compute_invocations_per_workgroup);
    if geometry.local_size > max_local {
        return Err(GpuError::Geometry(format!(
            "local work size {} exceeds the adapter limit of {max_local}",
            geometry.local_size
        )));
    }
    dispatch_shape(
        geometry.grid_size,
        geometry.local_size,
        limits.max_compute_workgroups_per_dimension,
    )
}

impl GpuBackend {
    pub fn new(config: GpuConfig) -> Result<Self, GpuError> {
        block_on(Self::init(config))
    }

    async fn init(config: GpuConfig) -> Result<Self, GpuError> {
        log::info!(target: "gpu_engine", "Initializing WGPU...");
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapters: Vec<_> = instance
            .enumerate_adapters(wgpu::Backends::PRIMARY)
            .into_iter()
            .collect();
        for (i, adapter) in adapters.iter().enumerate() {
            log::debug!(target: "gpu_engine", "Adapter {}: {:?}", i, adapter.get_info());
        }

        let no_adapter = || GpuError::NoAdapter {
            platform: config.platform,
            device: config.device,
            available: adapters.len(),
        };
        let platforms = platforms(&adapters);
        let platform = config.platform.unwrap_or(0);
        let backend = *platforms.get(platform).ok_or_else(no_adapter)?;
        let adapter = adapters
            .iter()
            .filter(|a| a.get_info().backend == backend)
            .nth(config.device)
            .ok_or_else(no_adapter)?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        log::info!(
            target: "gpu_engine",
            "Using platform {} device {}: {} (Backend: {:?}, Type: {:?})",
            platform,
            config.device,
            info.name,
            info.backend,
            info.device_type
        );

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Search Device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                memory_hints: Default::default(),
                ..Default::default()
            })
            .await
            .map_err(|source| GpuError::RequestDevice {
                platform,
                device: config.device,
                source,
            })?;

        Ok(Self {
            config,
            platform,
            info,
            limits,
            device,
            queue,
            job: None,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    fn device_error(&self, message: impl Into<String>) -> GpuError {
        GpuError::Device {
            platform: self.platform,
            device: self.config.device,
            message: message.into(),
        }
    }

    fn build_pipeline(&self, geometry: &BatchGeometry) -> Result<wgpu::ComputePipeline, GpuError> {
        let source = kernel::load_source(self.config.kernel.as_deref())?;
        let source = kernel::with_constants(
            &source,
            geometry.lanes_per_item as u32,
            geometry.local_size,
        );

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Search Kernel"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Search Pipeline"),
                layout: None,
                module: &shader,
                entry_point: Some(kernel::ENTRY_POINT),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            return Err(GpuError::KernelBuild {
                platform: self.platform,
                device: self.config.device,
                kernel: self.config.kernel_name(),
                message: err.to_string(),
            });
        }
        Ok(pipeline)
    }

    fn prepare(
        &self,
        geometry: BatchGeometry,
        slot: NonceSlot,
        template: &MessageTemplate,
        target: &Target,
    ) -> Result<GpuJob, GpuError> {
        let workgroups = check_geometry(&geometry, &self.limits)?;
        let ctx = JobContext::new(template.clone(), slot, *target);
        let pipeline = self.build_pipeline(&geometry)?;

        let params = JobParams::new(&ctx, geometry.grid_size as u32);
        let job_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Job Buffer"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let words_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Words Buffer"),
                contents: bytemuck::cast_slice(&ctx.variable_words),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let batch_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Batch Buffer"),
            size: std::mem::size_of::<BatchParams>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let result_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Result Buffer"),
            size: SearchResult::SIZE,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: SearchResult::SIZE,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group_layout = pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Search Bind Group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: job_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: words_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: batch_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: result_buffer.as_entire_binding(),
                },
            ],
        });

        log::debug!(
            target: "gpu_engine",
            "Kernel built: {} lanes x {} nonces, {} per workgroup, dispatch {}x{}, {} variable block(s)",
            geometry.grid_size,
            geometry.lanes_per_item,
            geometry.local_size,
            workgroups.0,
            workgroups.1,
            ctx.variable_blocks()
        );

        Ok(GpuJob {
            pipeline,
            bind_group,
            _job_buffer: job_buffer,
            _words_buffer: words_buffer,
            batch_buffer,
            result_buffer,
            staging_buffer,
            workgroups,
        })
    }

    fn run_batch(&self, job: &GpuJob, start_nonce: u64) -> Result<SearchResult, GpuError> {
        self.queue.write_buffer(
            &job.batch_buffer,
            0,
            bytemuck::bytes_of(&BatchParams::from_start(start_nonce)),
        );
        self.queue.write_buffer(
            &job.result_buffer,
            0,
            bytemuck::bytes_of(&SearchResult::default()),
        );

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Search Encoder"),
            });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Search Pass"),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&job.pipeline);
            cpass.set_bind_group(0, &job.bind_group, &[]);
            cpass.dispatch_workgroups(job.workgroups.0, job.workgroups.1, 1);
        }
        encoder.copy_buffer_to_buffer(
            &job.result_buffer,
            0,
            &job.staging_buffer,
            0,
            SearchResult::SIZE,
        );
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = job.staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |v| {
            let _ = sender.send(v);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| self.device_error(format!("poll failed: {e}")))?;

        match block_on(receiver) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.device_error(format!("result readback failed: {e}"))),
            Err(_) => return Err(self.device_error("result readback was dropped")),
        }

        let result = {
            let data = buffer_slice.get_mapped_range();
            bytemuck::pod_read_unaligned::<SearchResult>(&data)
        };
        job.staging_buffer.unmap();
        Ok(result)
    }
}

impl SearchBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "gpu-wgpu"
    }

    fn start_search(
        &mut self,
        geometry: BatchGeometry,
        slot: NonceSlot,
        template: &MessageTemplate,
        target: &Target,
    ) -> Result<()> {
        geometry.validate()?;
        self.job = Some(self.prepare(geometry, slot, template, target)?);
        Ok(())
    }

    fn continue_search(&mut self, start_nonce: u64) -> Result<Option<u64>> {
        let job = self
            .job
            .as_ref()
            .ok_or_else(|| anyhow!("continue_search called before start_search"))?;
        let result = self.run_batch(job, start_nonce)?;
        if let Some(nonce) = result.nonce() {
            log::debug!(
                target: "gpu_engine",
                "Lane {} reported nonce {:016x}",
                result.lane,
                nonce
            );
        }
        Ok(result.nonce())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_shape_stays_one_dimensional_when_it_fits() {
        assert_eq!(dispatch_shape(1, 256, 65535).unwrap(), (1, 1));
        assert_eq!(dispatch_shape(1000, 256, 65535).unwrap(), (4, 1));
        assert_eq!(dispatch_shape(65535 * 256, 256, 65535).unwrap(), (65535, 1));
    }

    #[test]
    fn dispatch_shape_spills_into_second_dimension() {
        // 16M lanes at 64 per group need 262144 groups.
        let (x, y) = dispatch_shape(1 << 24, 64, 65535).unwrap();
        assert_eq!(x, 65535);
        assert_eq!(y, 5);
        assert!(x as u64 * y as u64 * 64 >= 1 << 24);
    }

    #[test]
    fn dispatch_shape_rejects_oversized_grids() {
        assert!(dispatch_shape(u32::MAX as u64, 1, 1024).is_err());
    }

    #[test]
    fn geometry_limits_are_enforced() {
        let limits = wgpu::Limits::default();
        let too_many = BatchGeometry::new(1 << 24, 256, 512).unwrap();
        assert!(matches!(
            check_geometry(&too_many, &limits),
            Err(GpuError::Geometry(_))
        ));
        let wide = BatchGeometry::new(1024, 4096, 1).unwrap();
        assert!(check_geometry(&wide, &limits).is_err());
        let ok = BatchGeometry::new(1 << 20, 256, 64).unwrap();
        assert_eq!(check_geometry(&ok, &limits).unwrap(), (4096, 1));
    }

    #[test]
    fn kernel_name_defaults_to_builtin() {
        let config = GpuConfig::default();
        assert_eq!(config.kernel_name(), "<built-in>");
        let config = GpuConfig {
            kernel: Some(PathBuf::from("custom.wgsl")),
            ..Default::default()
        };
        assert_eq!(config.kernel_name(), "custom.wgsl");
    }
}
