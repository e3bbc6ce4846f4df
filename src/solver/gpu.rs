//! wgpu implementation of `Device`.
//!
//! Working and preconditioner precision are both `f32` (WGSL has no
//! portable f64), so the preconditioner bridge always takes the direct
//! path. Kernels are submitted to the queue in call order; reductions read
//! their per-workgroup partials back synchronously and finish on the host.

use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::error::{FlexcgError, Result};
use crate::sparse::CsrMatrix;

use super::backend::Device;
use super::gpu_shaders::{self, ELEMENTWISE_WG, REDUCTION_WG};
use super::pcg::PCG_BLOCKSIZE;
use super::preconditioner::Jacobi;
use super::Operator;

/// Dispatch cap for element-wise kernels; they grid-stride past it.
const MAX_ELEMENTWISE_GROUPS: u32 = 65_535;

/// Pool alignment in f32 entries (256 bytes, the storage offset alignment).
const GPU_POOL_ALIGNMENT: usize = 64;

fn elementwise_groups(n: usize) -> u32 {
    n.div_ceil(ELEMENTWISE_WG as usize)
        .min(MAX_ELEMENTWISE_GROUPS as usize) as u32
}

fn reduction_groups(n: usize) -> u32 {
    n.div_ceil(REDUCTION_WG as usize).min(PCG_BLOCKSIZE) as u32
}

fn to_u32(what: &str, v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| FlexcgError::Device(format!("{what} {v} exceeds u32 range")))
}

// Shader VecParams layout: { alpha: f32, beta: f32, n: u32, pad: u32 }
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct VecParams {
    alpha: f32,
    beta: f32,
    n: u32,
    _pad: u32,
}

impl VecParams {
    fn new(alpha: f32, beta: f32, n: usize) -> Result<Self> {
        Ok(Self {
            alpha,
            beta,
            n: to_u32("vector length", n)?,
            _pad: 0,
        })
    }
}

/// GPU context holding the wgpu device, queue, and compute pipelines.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    axpy_pipeline: wgpu::ComputePipeline,
    dot_pipeline: wgpu::ComputePipeline,
    update_pipeline: wgpu::ComputePipeline,
    spmv_pipeline: wgpu::ComputePipeline,
    jacobi_pipeline: wgpu::ComputePipeline,
    /// Per-workgroup partials of `inner_prod`.
    dot_partials: wgpu::Buffer,
}

impl GpuContext {
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| FlexcgError::Device("no GPU adapter found".into()))?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("flexcg_gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| FlexcgError::Device(format!("failed to get GPU device: {e}")))?;

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("flexcg_shaders"),
            source: wgpu::ShaderSource::Wgsl(gpu_shaders::SHADER_SOURCE.into()),
        });

        let make_pipeline = |entry_point: &str| -> wgpu::ComputePipeline {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &shader_module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let axpy_pipeline = make_pipeline("axpy");
        let dot_pipeline = make_pipeline("dot_blocks");
        let update_pipeline = make_pipeline("update_pcg");
        let spmv_pipeline = make_pipeline("spmv");
        let jacobi_pipeline = make_pipeline("jacobi");

        let dot_partials = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("dot_partials"),
            size: (PCG_BLOCKSIZE * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        tracing::debug!(adapter = %adapter_name, "wgpu device ready");

        Ok(Self {
            device,
            queue,
            adapter_name,
            axpy_pipeline,
            dot_pipeline,
            update_pipeline,
            spmv_pipeline,
            jacobi_pipeline,
            dot_partials,
        })
    }
}

/// A device-resident f32 vector.
pub struct GpuVector {
    buffer: wgpu::Buffer,
    len: usize,
}

impl GpuVector {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

/// `Device` backed by a wgpu compute queue. Cheap to clone.
#[derive(Clone)]
pub struct WgpuDevice {
    ctx: Arc<GpuContext>,
}

impl WgpuDevice {
    /// Acquire the first high-performance adapter. Fails when none exists.
    pub fn new() -> Result<Self> {
        Ok(Self {
            ctx: Arc::new(GpuContext::new()?),
        })
    }

    fn vector_usage() -> wgpu::BufferUsages {
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
    }

    /// Read-only storage buffer. Bindings may not be empty, so an empty
    /// slice still gets one element.
    fn storage_init<T: bytemuck::Pod>(&self, label: &str, data: &[T]) -> wgpu::Buffer {
        let pad = [T::zeroed()];
        let contents = if data.is_empty() { &pad[..] } else { data };
        self.ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(contents),
                usage: wgpu::BufferUsages::STORAGE,
            })
    }

    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        buffers: &[&wgpu::Buffer],
        params: VecParams,
        groups: u32,
    ) {
        if groups == 0 {
            return;
        }
        let device = &self.ctx.device;
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: None,
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buf)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: buffers.len() as u32,
            resource: params_buf.as_entire_binding(),
        });
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });
        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        self.ctx.queue.submit(Some(encoder.finish()));
    }

    fn copy(&self, n: usize, src: &wgpu::Buffer, dst: &wgpu::Buffer) {
        if n == 0 {
            return;
        }
        let size = (n * std::mem::size_of::<f32>()) as u64;
        let mut encoder = self.ctx.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(src, 0, dst, 0, size);
        self.ctx.queue.submit(Some(encoder.finish()));
    }

    /// Read `count` f32 values back to the host, waiting for prior work.
    fn read_f32(&self, src: &wgpu::Buffer, count: usize) -> Result<Vec<f32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let device = &self.ctx.device;
        let size = (count * std::mem::size_of::<f32>()) as u64;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
        self.ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = sender.send(r);
        });
        device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| FlexcgError::Device(format!("device poll failed: {e}")))?;
        receiver
            .recv()
            .map_err(|_| FlexcgError::Device("readback callback dropped".into()))?
            .map_err(|e| FlexcgError::Device(format!("buffer map failed: {e}")))?;

        let data = slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }

    fn sum_partials(&self, src: &wgpu::Buffer, count: usize) -> Result<f32> {
        let partials = self.read_f32(src, count)?;
        Ok(partials.iter().fold(0.0f32, |acc, &v| acc + v))
    }
}

impl Device for WgpuDevice {
    type Work = f32;
    type Precon = f32;
    type WorkVector = GpuVector;
    type PreconVector = GpuVector;

    fn name(&self) -> String {
        format!("wgpu ({})", self.ctx.adapter_name)
    }

    fn mem_pool_alignment(&self) -> usize {
        GPU_POOL_ALIGNMENT
    }

    fn alloc_work(&self, len: usize) -> Result<GpuVector> {
        let buffer = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("work_vector"),
            size: (len.max(1) * std::mem::size_of::<f32>()) as u64,
            usage: Self::vector_usage(),
            mapped_at_creation: false,
        });
        Ok(GpuVector { buffer, len })
    }

    fn alloc_precon(&self, len: usize) -> Result<GpuVector> {
        self.alloc_work(len)
    }

    fn upload(&self, data: &[f32]) -> Result<GpuVector> {
        let pad = [0.0f32];
        let contents = if data.is_empty() { &pad[..] } else { data };
        let buffer = self
            .ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("uploaded_vector"),
                contents: bytemuck::cast_slice(contents),
                usage: Self::vector_usage(),
            });
        Ok(GpuVector {
            buffer,
            len: data.len(),
        })
    }

    fn download(&self, v: &GpuVector) -> Result<Vec<f32>> {
        self.read_f32(&v.buffer, v.len)
    }

    fn work_len(&self, v: &GpuVector) -> usize {
        v.len
    }

    fn axpy(
        &self,
        n: usize,
        alpha: f32,
        x: &GpuVector,
        beta: f32,
        y: &mut GpuVector,
    ) -> Result<()> {
        self.dispatch(
            &self.ctx.axpy_pipeline,
            &[&x.buffer, &y.buffer],
            VecParams::new(alpha, beta, n)?,
            elementwise_groups(n),
        );
        Ok(())
    }

    fn inner_prod(&self, n: usize, x: &GpuVector, y: &GpuVector) -> Result<f32> {
        if n == 0 {
            return Ok(0.0);
        }
        let groups = reduction_groups(n);
        self.dispatch(
            &self.ctx.dot_pipeline,
            &[&x.buffer, &y.buffer, &self.ctx.dot_partials],
            VecParams::new(0.0, 0.0, n)?,
            groups,
        );
        self.sum_partials(&self.ctx.dot_partials, groups as usize)
    }

    fn update_pcg(
        &self,
        n: usize,
        n_blocks: usize,
        alpha: f32,
        ap: &GpuVector,
        r: &mut GpuVector,
        partials: &mut GpuVector,
    ) -> Result<f32> {
        if n == 0 {
            return Ok(0.0);
        }
        if n_blocks == 0 {
            return Err(FlexcgError::Dimension(format!(
                "{n} entries to update with zero reduction blocks"
            )));
        }
        if partials.len < n_blocks {
            return Err(FlexcgError::Dimension(format!(
                "reduction staging holds {} entries, {} blocks requested",
                partials.len, n_blocks
            )));
        }
        let groups = to_u32("block count", n_blocks)?;
        self.dispatch(
            &self.ctx.update_pipeline,
            &[&ap.buffer, &r.buffer, &partials.buffer],
            VecParams::new(alpha, 0.0, n)?,
            groups,
        );
        self.sum_partials(&partials.buffer, n_blocks)
    }

    fn narrow(&self, n: usize, src: &GpuVector, dst: &mut GpuVector) {
        self.copy(n, &src.buffer, &dst.buffer);
    }

    fn widen(&self, n: usize, src: &GpuVector, dst: &mut GpuVector) {
        self.copy(n, &src.buffer, &dst.buffer);
    }

    fn as_precon<'v>(&self, v: &'v GpuVector) -> Option<&'v GpuVector> {
        Some(v)
    }

    fn as_precon_mut<'v>(&self, v: &'v mut GpuVector) -> Option<&'v mut GpuVector> {
        Some(v)
    }
}

/// CSR matrix resident on the GPU, applied with the `spmv` kernel.
pub struct GpuCsrOperator {
    device: WgpuDevice,
    values: wgpu::Buffer,
    col_indices: wgpu::Buffer,
    row_pointers: wgpu::Buffer,
    nrows: usize,
    ncols: usize,
}

impl GpuCsrOperator {
    pub fn new(device: &WgpuDevice, matrix: &CsrMatrix<f32>) -> Result<Self> {
        to_u32("nnz", matrix.nnz())?;
        to_u32("column count", matrix.ncols)?;
        let col_indices: Vec<u32> = matrix.col_indices.iter().map(|&c| c as u32).collect();
        let row_pointers: Vec<u32> = matrix.row_pointers.iter().map(|&r| r as u32).collect();
        Ok(Self {
            device: device.clone(),
            values: device.storage_init("csr_values", &matrix.values),
            col_indices: device.storage_init("csr_col_indices", &col_indices),
            row_pointers: device.storage_init("csr_row_pointers", &row_pointers),
            nrows: matrix.nrows,
            ncols: matrix.ncols,
        })
    }
}

impl Operator<GpuVector> for GpuCsrOperator {
    fn apply(&mut self, input: &GpuVector, output: &mut GpuVector) -> Result<()> {
        if input.len < self.ncols || output.len < self.nrows {
            return Err(FlexcgError::Dimension(format!(
                "gpu csr: {}x{} matrix, input {}, output {}",
                self.nrows, self.ncols, input.len, output.len
            )));
        }
        self.device.dispatch(
            &self.device.ctx.spmv_pipeline,
            &[
                &self.values,
                &self.col_indices,
                &self.row_pointers,
                &input.buffer,
                &output.buffer,
            ],
            VecParams::new(0.0, 0.0, self.nrows)?,
            elementwise_groups(self.nrows),
        );
        Ok(())
    }
}

/// Damped Jacobi on the GPU: `z = inv_diag * r`.
pub struct GpuJacobi {
    device: WgpuDevice,
    inv_diag: wgpu::Buffer,
    n: usize,
}

impl GpuJacobi {
    pub fn new(device: &WgpuDevice, jacobi: &Jacobi<f32>) -> Self {
        Self {
            device: device.clone(),
            inv_diag: device.storage_init("inv_diag", jacobi.inv_diag()),
            n: jacobi.inv_diag().len(),
        }
    }

    pub fn from_matrix(device: &WgpuDevice, matrix: &CsrMatrix<f64>, omega: f64) -> Result<Self> {
        Ok(Self::new(device, &Jacobi::from_matrix(matrix, omega)?))
    }
}

impl Operator<GpuVector> for GpuJacobi {
    fn apply(&mut self, input: &GpuVector, output: &mut GpuVector) -> Result<()> {
        self.device.dispatch(
            &self.device.ctx.jacobi_pipeline,
            &[&self.inv_diag, &input.buffer, &output.buffer],
            VecParams::new(0.0, 0.0, self.n)?,
            elementwise_groups(self.n),
        );
        Ok(())
    }
}
