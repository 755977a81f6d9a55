//! Probes the `subgroup_size` of the compute device.
//!
//! The radix sort kernels are specialized for the probed value, so the probe
//! has to run once before the sort pipelines are created.

use log::info;

use crate::RadixSortError;

pub const GET_SUBGROUP_SIZE_SHADER: &str = include_str!("get_subgroup_size.wgsl");

/// Features the probe and the sort kernels both depend on.
///
/// `SUBGROUP` covers the ballot/inclusive-add/add intrinsics and the
/// `subgroup_size` builtin; `PUSH_CONSTANTS` covers the per-dispatch
/// parameter block of the sort kernels.
pub const REQUIRED_FEATURES: wgpu::Features =
    wgpu::Features::SUBGROUP.union(wgpu::Features::PUSH_CONSTANTS);

/// A one-workgroup pipeline that writes the device's `subgroup_size` builtin
/// into a single-element storage buffer.
#[derive(Debug)]
pub struct GetSubgroupSizeUtils {
    pipeline: wgpu::ComputePipeline,
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl GetSubgroupSizeUtils {
    pub fn new(device: &wgpu::Device) -> Result<Self, RadixSortError> {
        let missing = REQUIRED_FEATURES.difference(device.features());
        if !missing.is_empty() {
            return Err(RadixSortError::MissingFeatures(missing));
        }

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("get_subgroup_size bindgroup layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("get_subgroup_size buffer"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("get_subgroup_size bindgroup"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("get_subgroup_size shader"),
            source: wgpu::ShaderSource::Wgsl(GET_SUBGROUP_SIZE_SHADER.into()),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("get_subgroup_size pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("get_subgroup_size pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            pipeline,
            buffer,
            bind_group,
        })
    }

    /// Dispatches the probe, blocks on the readback and returns the value.
    pub fn get_subgroup_size(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Result<SubgroupSize, RadixSortError> {
        let staging_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("get_subgroup_size staging buffer"),
            size: 4,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("get_subgroup_size command encoder"),
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("get_subgroup_size pass"),
                timestamp_writes: None,
            });

            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }

        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging_buf, 0, 4);

        let submission_index = queue.submit([encoder.finish()]);

        let slice = staging_buf.slice(0..4);
        slice.map_async(wgpu::MapMode::Read, |_| ());
        device
            .poll(wgpu::PollType::WaitForSubmissionIndex(submission_index))
            .map_err(|_| RadixSortError::ProbeReadback)?;

        let subgroup_size: u32 = bytemuck::cast_slice(&slice.get_mapped_range())[0];
        staging_buf.unmap();

        info!("subgroup_size: {subgroup_size}");

        Ok(SubgroupSize(subgroup_size))
    }
}

/// The probed subgroup (warp/wavefront/SIMD-group) width of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubgroupSize(pub u32);

impl From<SubgroupSize> for u32 {
    fn from(value: SubgroupSize) -> Self {
        value.0
    }
}
impl From<&SubgroupSize> for u32 {
    fn from(value: &SubgroupSize) -> Self {
        value.0
    }
}
