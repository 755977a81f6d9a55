//! Radix sort algorithm used for sorting keys of type `u32` on the GPU.
//!
//! The crate is engine-agnostic: it consumes a [`wgpu::Device`] capable of
//! compute shaders, push constants, storage buffers and subgroup intrinsics,
//! and records its work into a caller-provided [`wgpu::CommandEncoder`].
//! Probe the device once with [`GetSubgroupSizeUtils`], build a
//! [`RadixSortPipeline`] specialized for the probed subgroup size, create the
//! buffer/bind-group pair, then call [`run`] per sort.

pub mod get_subgroup_size;
pub use get_subgroup_size::*;

use std::ops::Range;

use thiserror::Error;

pub const NUMBER_OF_BYTES_PER_KEY: u32 = std::mem::size_of::<u32>() as u32;
/// The number of key bits consumed per pass.
///
/// The first step of every pass builds a histogram with one bin per radix
/// value, so the radix must stay small; 8 bits (one byte, 256 bins) is the
/// natural choice. For `u32` keys this means 4 passes.
pub const NUMBER_OF_RADIX_BITS: u32 = 8;
/// The radix cardinality; with 8 radix bits the radix range is [0, 255].
pub const NUMBER_OF_RADIX: u32 = 1 << NUMBER_OF_RADIX_BITS;
/// The number of passes needed to consume all 32 key bits.
pub const NUMBER_OF_PASSES: u32 = u32::BITS / NUMBER_OF_RADIX_BITS;

/// `WARP` (Nvidia), `WAVEFRONT` (AMD) and `SIMD group` (Apple) all name the
/// same thing; here it is uniformly called `subgroup`.
///
/// The kernels require one thread per radix bin during the histogram and
/// scan steps, so the workgroup width must equal [`NUMBER_OF_RADIX`]. 256 is
/// also a multiple of every subgroup size in the wild, which the scatter
/// kernel depends on.
pub const NUMBER_OF_THREADS_PER_WORKGROUP: u32 = NUMBER_OF_RADIX;
/// The number of key rows processed by each workgroup.
///
/// A block is laid out row-major across the workgroup:
///
/// ```text
///              thread 0       thread 1                       thread 255
///         ┌───────────────┬───────────────┬───────────────┬───────────────┐
///  row 0  │      K_0      │      K_1      │     ...       │     K_255     │
///         ├───────────────┼───────────────┼───────────────┼───────────────┤
///  row 1  │     K_256     │     K_257     │     ...       │     K_511     │
///         ├───────────────┴───────────────┴───────────────┴───────────────┤
///   ...   │                              ...                              │
///         └───────────────────────────────────────────────────────────────┘
/// ```
///
/// An odd row count (3/7/15) keeps the shared-memory reorder free of bank
/// conflicts. 7 measured best on the hardware at hand.
pub const NUMBER_OF_ROWS_PER_WORKGROUP: u32 = 7;
/// Keys per block, i.e. per count/scatter workgroup.
pub const NUMBER_OF_KEYS_PER_SCATTER_BLOCK: u32 =
    NUMBER_OF_THREADS_PER_WORKGROUP * NUMBER_OF_ROWS_PER_WORKGROUP;

// The scatter kernel packs a key's block position into the high half of its
// order word.
const _: () = assert!(NUMBER_OF_KEYS_PER_SCATTER_BLOCK <= 1 << 16);

pub const RADIX_SORT_SHADER: &str = include_str!("radix_sort.wgsl");

const WORKGROUP_OFFSET_OFFSET: u32 = 0;
/// The number of keys to be sorted.
const NUMBER_OF_KEYS_OFFSET: u32 = 4;
/// The number of blocks (histograms) required.
///
/// `number_of_blks` = ceil(`number_of_keys` / [`NUMBER_OF_KEYS_PER_SCATTER_BLOCK`])
const NUMBER_OF_BLKS_OFFSET: u32 = 8;
/// The current pass index, within [0, 3] for `u32` keys with an 8-bit radix.
///
/// LSD ordering: pass 0 sorts on bits 0x000000XX, pass 1 on 0x0000XX00,
/// pass 2 on 0x00XX0000, pass 3 on 0xXX000000.
const PASS_INDEX_OFFSET: u32 = 12;
/// The stride of the current up-/down-sweep round of the block-axis scan.
const SWEEP_SIZE_OFFSET: u32 = 16;
/// Whether pass 0 should synthesize `val = key index` instead of reading the
/// value buffer, yielding the identity permutation as values.
const INIT_INDEX_OFFSET: u32 = 20;

const PUSH_CONSTANT_RANGES: wgpu::PushConstantRange = wgpu::PushConstantRange {
    stages: wgpu::ShaderStages::COMPUTE,
    range: 0..24,
};

/// Host-side failures. All of them are raised before any GPU work is
/// submitted; the kernels themselves cannot signal errors.
#[derive(Debug, Error)]
pub enum RadixSortError {
    #[error("device is missing required features: {0:?}")]
    MissingFeatures(wgpu::Features),
    #[error("device push constant limit is {supported} bytes, the sort needs 24")]
    PushConstantLimit { supported: u32 },
    #[error(
        "unsupported subgroup size {0}: must be a power of two within [16, 128]"
    )]
    UnsupportedSubgroupSize(u32),
    #[error(
        "scatter kernel needs {required} bytes of workgroup storage, device supports {supported}"
    )]
    InsufficientWorkgroupStorage { required: u32, supported: u32 },
    #[error("number_of_keys {requested} exceeds the buffer capacity {capacity}")]
    TooManyKeys { requested: u32, capacity: u32 },
    #[error("invalid pass range {start}..{end}: pass indices lie within 0..4")]
    InvalidPassRange { start: u32, end: u32 },
    #[error("failed to read back the probed subgroup size")]
    ProbeReadback,
}

/// Sizing configuration: the largest key count the buffers must hold.
#[derive(Debug, Clone, Copy)]
pub struct RadixSortSettings {
    max_number_of_keys: u32,
}

impl RadixSortSettings {
    pub fn max_number_of_keys(&self) -> u32 {
        self.max_number_of_keys
    }
}

impl From<u32> for RadixSortSettings {
    fn from(max_number_of_keys: u32) -> Self {
        Self { max_number_of_keys }
    }
}

/// ## Introduction
///
/// This implementation of the `radix-sort` algorithm is based on the paper:
/// [Fast 4-way parallel radix sorting on GPUs](http://www.sci.utah.edu/~csilva/papers/cgf.pdf)
///
/// Each of the four passes runs in 3 steps:
///
/// 1. Count the number of each radix per `block` into a histogram row
///    (count_radix_pipeline).
/// 2. Prefix-sum the histogram rows (scan_upsweep_pipeline,
///    scan_dnsweep_pipeline, scan_last_block_pipeline).
/// 3. Write every key of a `block` to its globally ordered position
///    (scatter_pipeline).
///
/// ## Histogram memory layout
///
/// The histogram matrix is stored block-major, one contiguous 256-bin row per
/// block:
///
/// ```text
///                  radix 0         radix 1          ...            radix 255
///             ┌───────────────┬───────────────┬───────────────┬───────────────┐
/// workgroup0  │      V_0      │      V_1      │     ...       │     V_255     │
///             ├───────────────┼───────────────┼───────────────┼───────────────┤
/// workgroup1  │     V_256     │     V_257     │     ...       │     V_511     │
///             ├───────────────┼───────────────┼───────────────┼───────────────┤
///    ...      │                              ...                              │
///             └───────────────┴───────────────┴───────────────┴───────────────┘
/// ```
///
/// Radix-major storage would make step 2 a trivial per-row scan, but turns
/// the far more bandwidth-hungry steps 1 and 3 into non-coalesced access
/// patterns. With block-major rows, steps 1 and 3 stream whole rows, and
/// step 2 becomes a Blelloch-style scan over rows: an up-sweep builds
/// power-of-two partial sums along the block axis, a down-sweep distributes
/// them into the skipped rows, and a final single-workgroup pass converts
/// the last row (the per-radix totals) into the exclusive scan across bins,
/// i.e. each radix's global starting offset. Each workgroup processes
/// [`NUMBER_OF_ROWS_PER_WORKGROUP`] rows of keys per block, which divides the
/// number of histogram rows (and with it the cost of step 2) by the same
/// factor.
///
/// A decoupled-lookback formulation would halve the scan traffic again, but
/// it needs either device-scope memory barriers or forward-progress
/// guarantees between workgroups, and WebGPU guarantees neither.
#[derive(Debug)]
pub struct RadixSortPipeline {
    /// Generate the per-block histogram of radix counts.
    count_radix_pipeline: wgpu::ComputePipeline,
    /// One reduction round of the block-axis inclusive prefix sum.
    scan_upsweep_pipeline: wgpu::ComputePipeline,
    /// One distribution round of the block-axis inclusive prefix sum.
    scan_dnsweep_pipeline: wgpu::ComputePipeline,
    /// Exclusive scan across the 256 bins of the last histogram row.
    scan_last_block_pipeline: wgpu::ComputePipeline,
    /// Write keys/values of each block to their globally ordered positions.
    scatter_pipeline: wgpu::ComputePipeline,
    /// Shared by all five pipelines:
    ///
    /// ```wgsl
    /// @binding(0) var<storage, read>       global_keys_i: array<u32>;
    /// @binding(1) var<storage, read>       global_vals_i: array<u32>;
    /// @binding(2) var<storage, read_write> global_blocks: array<u32>;
    /// @binding(3) var<storage, read_write> global_keys_o: array<u32>;
    /// @binding(4) var<storage, read_write> global_vals_o: array<u32>;
    /// ```
    bind_group_layout: wgpu::BindGroupLayout,
    subgroup_size: u32,
}

impl RadixSortPipeline {
    /// Builds the five compute pipelines, specialized for the probed
    /// `subgroup_size`.
    ///
    /// Fails without touching the queue when the device lacks the required
    /// features or limits, or when the probed subgroup size cannot satisfy
    /// the kernel constraints (power of two, divides 256, and
    /// `256 / subgroup_size <= subgroup_size` so the two-level workgroup
    /// scans fit into one subgroup).
    pub fn new(
        device: &wgpu::Device,
        subgroup_size: SubgroupSize,
    ) -> Result<Self, RadixSortError> {
        let missing = REQUIRED_FEATURES.difference(device.features());
        if !missing.is_empty() {
            return Err(RadixSortError::MissingFeatures(missing));
        }

        let limits = device.limits();
        if limits.max_push_constant_size < PUSH_CONSTANT_RANGES.range.end {
            return Err(RadixSortError::PushConstantLimit {
                supported: limits.max_push_constant_size,
            });
        }

        let subgroup_size = u32::from(subgroup_size);
        if !subgroup_size.is_power_of_two() || !(16..=128).contains(&subgroup_size) {
            return Err(RadixSortError::UnsupportedSubgroupSize(subgroup_size));
        }

        let number_of_subgroups = NUMBER_OF_THREADS_PER_WORKGROUP / subgroup_size;
        let scatter_shared_size =
            NUMBER_OF_KEYS_PER_SCATTER_BLOCK.max(NUMBER_OF_RADIX * number_of_subgroups);
        let required_workgroup_storage =
            (NUMBER_OF_RADIX + scatter_shared_size + number_of_subgroups) * 4;
        if limits.max_compute_workgroup_storage_size < required_workgroup_storage {
            return Err(RadixSortError::InsufficientWorkgroupStorage {
                required: required_workgroup_storage,
                supported: limits.max_compute_workgroup_storage_size,
            });
        }

        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("radix_sort bindgroup layout"),
                entries: &[
                    // Read unsorted (sub-sorted) keys from this buffer
                    storage_buffer_layout_entry(0, true),
                    // Read unsorted (sub-sorted) vals from this buffer
                    storage_buffer_layout_entry(1, true),
                    // Read/write histograms of the count of each radix
                    storage_buffer_layout_entry(2, false),
                    // Write sorted (sub-sorted) keys to this buffer
                    storage_buffer_layout_entry(3, false),
                    // Write sorted (sub-sorted) vals to this buffer
                    storage_buffer_layout_entry(4, false),
                ],
            });

        let shader_source = compose_shader_source(subgroup_size);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("radix_sort shader"),
            source: wgpu::ShaderSource::Wgsl(shader_source.into()),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("radix_sort pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[PUSH_CONSTANT_RANGES],
        });

        let compute_pipeline = |label: &str, entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        Ok(Self {
            count_radix_pipeline: compute_pipeline("radix_sort: count_radix pipeline", "count_radix"),
            scan_upsweep_pipeline: compute_pipeline(
                "radix_sort: scan_upsweep pipeline",
                "scan_upsweep",
            ),
            scan_dnsweep_pipeline: compute_pipeline(
                "radix_sort: scan_dnsweep pipeline",
                "scan_dnsweep",
            ),
            scan_last_block_pipeline: compute_pipeline(
                "radix_sort: scan_last_block pipeline",
                "scan_last_block",
            ),
            scatter_pipeline: compute_pipeline("radix_sort: scatter pipeline", "scatter"),
            bind_group_layout,
            subgroup_size,
        })
    }

    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }

    pub fn subgroup_size(&self) -> u32 {
        self.subgroup_size
    }
}

fn storage_buffer_layout_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
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

/// Prepends the tuning constants to the kernel source. All five pipelines are
/// compiled from this one module, so the constants cannot drift apart.
fn compose_shader_source(subgroup_size: u32) -> String {
    let number_of_subgroups = NUMBER_OF_THREADS_PER_WORKGROUP / subgroup_size;
    let scatter_shared_size =
        NUMBER_OF_KEYS_PER_SCATTER_BLOCK.max(NUMBER_OF_RADIX * number_of_subgroups);

    format!(
        "enable subgroups;\n\n\
         const NUMBER_OF_THREADS_PER_WORKGROUP: u32 = {threads}u;\n\
         const NUMBER_OF_ROWS_PER_WORKGROUP: u32 = {rows}u;\n\
         const NUMBER_OF_RADIX: u32 = {radix}u;\n\
         const NUMBER_OF_RADIX_BITS: u32 = {radix_bits}u;\n\
         const NUMBER_OF_THREADS_PER_SUBGROUP: u32 = {subgroup_size}u;\n\
         const NUMBER_OF_SUBGROUPS_PER_WORKGROUP: u32 = {subgroups}u;\n\
         const NUMBER_OF_KEYS_PER_BLOCK: u32 = {keys_per_block}u;\n\
         const SCATTER_SHARED_SIZE: u32 = {scatter_shared}u;\n\n{body}",
        threads = NUMBER_OF_THREADS_PER_WORKGROUP,
        rows = NUMBER_OF_ROWS_PER_WORKGROUP,
        radix = NUMBER_OF_RADIX,
        radix_bits = NUMBER_OF_RADIX_BITS,
        subgroup_size = subgroup_size,
        subgroups = number_of_subgroups,
        keys_per_block = NUMBER_OF_KEYS_PER_SCATTER_BLOCK,
        scatter_shared = scatter_shared_size,
        body = RADIX_SORT_SHADER,
    )
}

/// The buffer quintet of one sorter instance.
///
/// The sub-sort of a pass is not in place, so keys and values each need two
/// buffers that alternate between the input and output roles; `global_blocks`
/// holds the histogram matrix and is rewritten every pass.
#[derive(Debug)]
pub struct RadixSortBuffers {
    eve_global_keys_buf: wgpu::Buffer,
    eve_global_vals_buf: wgpu::Buffer,
    global_blocks_buf: wgpu::Buffer,
    odd_global_keys_buf: wgpu::Buffer,
    odd_global_vals_buf: wgpu::Buffer,
    max_number_of_keys: u32,
}

impl RadixSortBuffers {
    pub fn new(device: &wgpu::Device, settings: RadixSortSettings) -> Self {
        let max_number_of_keys = settings.max_number_of_keys().max(1);
        let max_number_of_blks =
            max_number_of_keys.div_ceil(NUMBER_OF_KEYS_PER_SCATTER_BLOCK);

        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let size = u64::from(max_number_of_keys) * u64::from(NUMBER_OF_BYTES_PER_KEY);

        let keyval_buffer = |label: &str| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };

        let eve_global_keys_buf = keyval_buffer(
            "radix_sort: global_keys buffer - input when even-pass, output when odd-pass",
        );
        let eve_global_vals_buf = keyval_buffer(
            "radix_sort: global_vals buffer - input when even-pass, output when odd-pass",
        );
        let odd_global_keys_buf = keyval_buffer(
            "radix_sort: global_keys buffer - input when odd-pass, output when even-pass",
        );
        let odd_global_vals_buf = keyval_buffer(
            "radix_sort: global_vals buffer - input when odd-pass, output when even-pass",
        );

        // Sized for the power-of-two padded block count; wgpu zero-initializes
        // the buffer and the kernels never write a row past the real block
        // count, so the padded tail rows stay zero.
        let global_blocks_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix_sort: global_blocks buffer"),
            size: u64::from(max_number_of_blks.next_power_of_two())
                * u64::from(NUMBER_OF_RADIX)
                * u64::from(NUMBER_OF_BYTES_PER_KEY),
            usage,
            mapped_at_creation: false,
        });

        Self {
            eve_global_keys_buf,
            eve_global_vals_buf,
            global_blocks_buf,
            odd_global_keys_buf,
            odd_global_vals_buf,
            max_number_of_keys,
        }
    }

    pub fn max_number_of_keys(&self) -> u32 {
        self.max_number_of_keys
    }

    pub fn eve_global_keys_buf(&self) -> &wgpu::Buffer {
        &self.eve_global_keys_buf
    }

    pub fn eve_global_vals_buf(&self) -> &wgpu::Buffer {
        &self.eve_global_vals_buf
    }

    pub fn global_blocks_buf(&self) -> &wgpu::Buffer {
        &self.global_blocks_buf
    }

    pub fn odd_global_keys_buf(&self) -> &wgpu::Buffer {
        &self.odd_global_keys_buf
    }

    pub fn odd_global_vals_buf(&self) -> &wgpu::Buffer {
        &self.odd_global_vals_buf
    }

    /// The keys buffer of the given parity; pair with
    /// [`output_in_even_buffers`] to locate a sort result.
    pub fn keys_buf(&self, even: bool) -> &wgpu::Buffer {
        if even {
            &self.eve_global_keys_buf
        } else {
            &self.odd_global_keys_buf
        }
    }

    /// The values buffer of the given parity.
    pub fn vals_buf(&self, even: bool) -> &wgpu::Buffer {
        if even {
            &self.eve_global_vals_buf
        } else {
            &self.odd_global_vals_buf
        }
    }
}

/// The two [`wgpu::BindGroup`]s that alternate as pass input/output.
///
/// When the pass reads from the even buffers, the even bind group is set; it
/// exposes the even buffers at the input slots and the odd buffers at the
/// output slots. The odd bind group swaps the roles.
#[derive(Debug)]
pub struct RadixSortBindGroup {
    /// Set this bind group when the pass reads from the even buffers.
    eve_bind_group: wgpu::BindGroup,
    /// Set this bind group when the pass reads from the odd buffers.
    odd_bind_group: wgpu::BindGroup,
    max_number_of_keys: u32,
}

impl RadixSortBindGroup {
    pub fn new(
        device: &wgpu::Device,
        radix_sort_pipeline: &RadixSortPipeline,
        buffers: &RadixSortBuffers,
    ) -> Self {
        let bind_group_layout = radix_sort_pipeline.bind_group_layout();

        let bind_group = |label: &str, keys_i: &wgpu::Buffer, vals_i: &wgpu::Buffer,
                          keys_o: &wgpu::Buffer, vals_o: &wgpu::Buffer| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: keys_i.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: vals_i.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: buffers.global_blocks_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: keys_o.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: vals_o.as_entire_binding(),
                    },
                ],
            })
        };

        let eve_bind_group = bind_group(
            "radix_sort: bind_group for even-pass",
            &buffers.eve_global_keys_buf,
            &buffers.eve_global_vals_buf,
            &buffers.odd_global_keys_buf,
            &buffers.odd_global_vals_buf,
        );

        let odd_bind_group = bind_group(
            "radix_sort: bind_group for odd-pass",
            &buffers.odd_global_keys_buf,
            &buffers.odd_global_vals_buf,
            &buffers.eve_global_keys_buf,
            &buffers.eve_global_vals_buf,
        );

        Self {
            eve_bind_group,
            odd_bind_group,
            max_number_of_keys: buffers.max_number_of_keys(),
        }
    }

    pub fn eve_bind_group(&self) -> &wgpu::BindGroup {
        &self.eve_bind_group
    }

    pub fn odd_bind_group(&self) -> &wgpu::BindGroup {
        &self.odd_bind_group
    }

    pub fn max_number_of_keys(&self) -> u32 {
        self.max_number_of_keys
    }
}

/// Records the dispatches for `pass_range` into `encoder`.
///
/// The keys to sort are read from the even buffers when `read_from_even` is
/// set, from the odd buffers otherwise, and each pass ping-pongs the roles;
/// use [`output_in_even_buffers`] to locate the result. With `init_index`
/// set, the first pass of the range writes `val = key index` instead of
/// reading the value input, so a full sort yields the sort permutation as
/// values.
///
/// `number_of_keys == 0` and an empty `pass_range` record nothing. All
/// validation happens before anything is recorded.
#[allow(clippy::too_many_arguments)]
pub fn run(
    encoder: &mut wgpu::CommandEncoder,
    radix_sort_pipeline: &RadixSortPipeline,
    radix_bind_group: &RadixSortBindGroup,
    max_compute_workgroups_per_dimension: u32,
    number_of_keys: u32,
    pass_range: Range<u32>,
    init_index: bool,
    read_from_even: bool,
) -> Result<(), RadixSortError> {
    if pass_range.start > pass_range.end || pass_range.end > NUMBER_OF_PASSES {
        return Err(RadixSortError::InvalidPassRange {
            start: pass_range.start,
            end: pass_range.end,
        });
    }
    if number_of_keys > radix_bind_group.max_number_of_keys() {
        return Err(RadixSortError::TooManyKeys {
            requested: number_of_keys,
            capacity: radix_bind_group.max_number_of_keys(),
        });
    }
    if number_of_keys == 0 || pass_range.is_empty() {
        return Ok(());
    }

    let number_of_blks = number_of_keys.div_ceil(NUMBER_OF_KEYS_PER_SCATTER_BLOCK);

    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some("radix_sort compute pass"),
        timestamp_writes: None,
    });

    pass.set_pipeline(&radix_sort_pipeline.count_radix_pipeline);
    pass.set_push_constants(NUMBER_OF_KEYS_OFFSET, bytemuck::bytes_of(&number_of_keys));
    pass.set_push_constants(NUMBER_OF_BLKS_OFFSET, bytemuck::bytes_of(&number_of_blks));
    pass.set_push_constants(INIT_INDEX_OFFSET, bytemuck::bytes_of(&(init_index as u32)));

    for pass_index in pass_range {
        pass.set_push_constants(PASS_INDEX_OFFSET, bytemuck::bytes_of(&pass_index));

        // If read_from_even is true:
        //   pass_index == 0: `eve_global_keys_buf` -> `odd_global_keys_buf`
        //   pass_index == 1: `odd_global_keys_buf` -> `eve_global_keys_buf`
        //   pass_index == 2: `eve_global_keys_buf` -> `odd_global_keys_buf`
        //   pass_index == 3: `odd_global_keys_buf` -> `eve_global_keys_buf`
        // If read_from_even is false, the roles are swapped.
        if (pass_index + read_from_even as u32) % 2 == 0 {
            pass.set_bind_group(0, radix_bind_group.odd_bind_group(), &[]);
        } else {
            pass.set_bind_group(0, radix_bind_group.eve_bind_group(), &[]);
        }

        // 1. count radix histogram
        {
            pass.set_pipeline(&radix_sort_pipeline.count_radix_pipeline);

            dispatch_workgroup_ext(
                &mut pass,
                number_of_blks,
                max_compute_workgroups_per_dimension,
                WORKGROUP_OFFSET_OFFSET,
            );
        }

        // 2. scan blocks
        {
            // scan up sweep (inclusive)
            pass.set_pipeline(&radix_sort_pipeline.scan_upsweep_pipeline);
            let num_round = log2_floor(number_of_blks);
            for r in 0..num_round {
                let sweep_size = 1u32 << r;
                let number_of_workgroups = number_of_blks / (2 * sweep_size);

                pass.set_push_constants(SWEEP_SIZE_OFFSET, bytemuck::bytes_of(&sweep_size));

                dispatch_workgroup_ext(
                    &mut pass,
                    number_of_workgroups,
                    max_compute_workgroups_per_dimension,
                    WORKGROUP_OFFSET_OFFSET,
                );
            }

            // scan down sweep (inclusive)
            pass.set_pipeline(&radix_sort_pipeline.scan_dnsweep_pipeline);
            let num_round = log2_ceil(number_of_blks).saturating_sub(1);
            for r in 0..num_round {
                let num_slots = num_round - r;
                let sweep_size = 1u32 << num_slots;

                let num_src_blocks_with_full_slots = number_of_blks / (2 * sweep_size);
                let extra_slots = 32 - (number_of_blks % sweep_size).leading_zeros();

                let number_of_workgroups =
                    num_src_blocks_with_full_slots * num_slots + extra_slots;

                pass.set_push_constants(SWEEP_SIZE_OFFSET, bytemuck::bytes_of(&sweep_size));

                dispatch_workgroup_ext(
                    &mut pass,
                    number_of_workgroups,
                    max_compute_workgroups_per_dimension,
                    WORKGROUP_OFFSET_OFFSET,
                );
            }

            // scan last block/histogram (exclusive)
            pass.set_pipeline(&radix_sort_pipeline.scan_last_block_pipeline);
            pass.dispatch_workgroups(1, 1, 1);
        }

        // 3. scatter
        {
            pass.set_pipeline(&radix_sort_pipeline.scatter_pipeline);

            dispatch_workgroup_ext(
                &mut pass,
                number_of_blks,
                max_compute_workgroups_per_dimension,
                WORKGROUP_OFFSET_OFFSET,
            );
        }

        // Only the first pass may write the index to `global_vals_buf`.
        pass.set_push_constants(INIT_INDEX_OFFSET, bytemuck::bytes_of(&0u32));
    }

    Ok(())
}

/// Whether a sort of `pass_count` passes that read its input from the
/// even-parity buffers first (`read_from_even`) leaves its result in the
/// even-parity buffers.
pub const fn output_in_even_buffers(pass_count: u32, read_from_even: bool) -> bool {
    (pass_count + read_from_even as u32) % 2 == 1
}

const fn log2_floor(x: u32) -> u32 {
    31 - x.leading_zeros()
}

const fn log2_ceil(x: u32) -> u32 {
    32 - x.leading_zeros() - (x.is_power_of_two() as u32)
}

/// Dispatches `number_of_workgroups` workgroups, splitting into a maximal 2D
/// grid plus a remainder dispatch when the per-dimension limit is exceeded.
/// The kernels flatten `workgroup_id` again and add the `workgroup_offset`
/// push constant the remainder dispatch carries.
pub fn dispatch_workgroup_ext(
    pass: &mut wgpu::ComputePass<'_>,
    number_of_workgroups: u32,
    max_compute_workgroups_per_dimension: u32,
    workgroup_offset_offset: u32,
) {
    pass.set_push_constants(workgroup_offset_offset, bytemuck::bytes_of(&0u32));

    if number_of_workgroups <= max_compute_workgroups_per_dimension {
        pass.dispatch_workgroups(number_of_workgroups, 1, 1);
    } else {
        let d = number_of_workgroups / max_compute_workgroups_per_dimension;

        pass.dispatch_workgroups(max_compute_workgroups_per_dimension, d, 1);

        let workgroup_offset = max_compute_workgroups_per_dimension * d;
        pass.set_push_constants(
            workgroup_offset_offset,
            bytemuck::bytes_of(&workgroup_offset),
        );
        pass.dispatch_workgroups(number_of_workgroups - workgroup_offset, 1, 1);
    }
}
