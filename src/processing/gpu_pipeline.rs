use std::sync::{
    OnceLock,
    atomic::{AtomicBool, Ordering},
    mpsc,
};

use image::RgbaImage;
use wgpu::util::DeviceExt;

use crate::error::{WarpError, WarpResult};
use crate::geometry::Quad;
use crate::state::{ResultSpec, SourceImage};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x2];

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    adapter_backend: String,
    adapter_driver: String,
}

static GPU_CONTEXT: OnceLock<Option<GpuContext>> = OnceLock::new();
static GPU_FALLBACK_REPORTED: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Debug, Default)]
/// Snapshot of GPU availability and adapter details.
pub struct RuntimeStatus {
    pub available: bool,
    pub adapter_name: Option<String>,
    pub adapter_backend: Option<String>,
    pub adapter_driver: Option<String>,
}

/// Returns whether a GPU device could be created.
pub fn is_available() -> bool {
    gpu_context().is_some()
}

/// Returns detailed GPU runtime status for UI diagnostics.
pub fn runtime_status() -> RuntimeStatus {
    match gpu_context() {
        Some(ctx) => RuntimeStatus {
            available: true,
            adapter_name: Some(ctx.adapter_name.clone()),
            adapter_backend: Some(ctx.adapter_backend.clone()),
            adapter_driver: Some(ctx.adapter_driver.clone()),
        },
        None => RuntimeStatus::default(),
    }
}

/// Render pipeline for one (source image, output size) pair.
///
/// The source texture is uploaded once at creation, corner uniforms are
/// rewritten only when the quad changes, and every [`draw`](Self::draw)
/// rasterises two triangles over the output and reads the framebuffer back.
/// GPU memory is released when the value is dropped.
pub struct GpuWarpPipeline {
    ctx: &'static GpuContext,
    source_id: u64,
    source_size: (u32, u32),
    result: ResultSpec,
    pipeline: wgpu::RenderPipeline,
    bind_group: wgpu::BindGroup,
    vertex_buffer: wgpu::Buffer,
    params_buffer: wgpu::Buffer,
    source_texture: wgpu::Texture,
    target_texture: wgpu::Texture,
    readback: wgpu::Buffer,
    padded_bytes_per_row: u32,
    uploaded_quad: Option<Quad>,
}

impl GpuWarpPipeline {
    pub fn new(source: &SourceImage, result: ResultSpec) -> WarpResult<Self> {
        let Some(ctx) = gpu_context() else {
            report_gpu_fallback_once();
            return Err(WarpError::GpuUnavailable);
        };
        let (src_w, src_h) = (source.width(), source.height());
        let max_dim = ctx.device.limits().max_texture_dimension_2d;
        if src_w > max_dim || src_h > max_dim || result.width > max_dim || result.height > max_dim
        {
            return Err(WarpError::gpu_setup(format!(
                "{src_w}x{src_h} -> {}x{} exceeds the device texture limit of {max_dim}",
                result.width, result.height
            )));
        }

        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("quad_warp_shader"),
                source: wgpu::ShaderSource::Wgsl(WARP_SHADER_SRC.into()),
            });
        let bgl = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("quad_warp_bgl"),
                entries: &warp_layout_entries(),
            });
        let layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("quad_warp_layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("quad_warp_pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: (2 * std::mem::size_of::<f32>()) as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &VERTEX_ATTRIBUTES,
                    }],
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TARGET_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
                cache: None,
            });

        // Two triangles over the output rectangle, in output pixels.
        let (out_w, out_h) = (result.width as f32, result.height as f32);
        let vertices: [f32; 12] = [
            0.0, 0.0, out_w, 0.0, 0.0, out_h, //
            0.0, out_h, out_w, out_h, out_w, 0.0,
        ];
        let vertex_buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("quad_warp_vertices"),
                contents: f32s_as_bytes(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let params_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("quad_warp_params"),
            size: std::mem::size_of::<[f32; 12]>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let src_extent = wgpu::Extent3d {
            width: src_w,
            height: src_h,
            depth_or_array_layers: 1,
        };
        let source_texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("quad_warp_source"),
            size: src_extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let target_texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("quad_warp_target"),
            size: result_extent(result),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let sampler = ctx.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("quad_warp_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let source_view = source_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("quad_warp_bg"),
            layout: &bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        let padded_bytes_per_row = padded_row_bytes(result.width);
        let readback = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("quad_warp_readback"),
            size: padded_bytes_per_row as u64 * result.height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let validation = pollster::block_on(ctx.device.pop_error_scope());
        let oom = pollster::block_on(ctx.device.pop_error_scope());
        if let Some(err) = validation.or(oom) {
            // Everything created above is dropped on return.
            return Err(WarpError::gpu_setup(err.to_string()));
        }

        ctx.queue.write_texture(
            source_texture.as_image_copy(),
            source.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(src_w.saturating_mul(4)),
                rows_per_image: Some(src_h),
            },
            src_extent,
        );

        tracing::debug!(
            source = source.id(),
            src_w,
            src_h,
            out_w = result.width,
            out_h = result.height,
            "gpu warp pipeline created"
        );

        Ok(Self {
            ctx,
            source_id: source.id(),
            source_size: (src_w, src_h),
            result,
            pipeline,
            bind_group,
            vertex_buffer,
            params_buffer,
            source_texture,
            target_texture,
            readback,
            padded_bytes_per_row,
            uploaded_quad: None,
        })
    }

    /// Whether this pipeline was built for `source` at `result` size.
    pub fn matches(&self, source: &SourceImage, result: ResultSpec) -> bool {
        self.source_id == source.id() && self.result == result
    }

    /// Writes the corner uniforms, skipping the upload if `quad` is unchanged.
    pub fn set_quad(&mut self, quad: &Quad) {
        if self.uploaded_quad.as_ref() == Some(quad) {
            return;
        }
        let params = warp_params(quad, self.source_size, self.result);
        self.ctx
            .queue
            .write_buffer(&self.params_buffer, 0, f32s_as_bytes(&params));
        self.uploaded_quad = Some(*quad);
    }

    pub fn render(&mut self, quad: &Quad) -> WarpResult<RgbaImage> {
        if !quad.is_finite() {
            return Err(WarpError::geometry(format!(
                "quad has non-finite corners: {quad:?}"
            )));
        }
        self.set_quad(quad);
        self.draw()
    }

    /// Draws with the current uniforms and blocks until the pixels are read back.
    pub fn draw(&mut self) -> WarpResult<RgbaImage> {
        if self.uploaded_quad.is_none() {
            return Err(WarpError::gpu_draw("no quad uploaded"));
        }
        let ctx = self.ctx;
        let (out_w, out_h) = (self.result.width, self.result.height);
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let target_view = self
            .target_texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("quad_warp_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("quad_warp_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.draw(0..6, 0..1);
        }
        encoder.copy_texture_to_buffer(
            self.target_texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &self.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(out_h),
                },
            },
            result_extent(self.result),
        );
        ctx.queue.submit([encoder.finish()]);

        if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(WarpError::gpu_draw(err.to_string()));
        }

        let slice = self.readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = ctx.device.poll(wgpu::Maintain::wait());
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(WarpError::gpu_draw(format!("readback map: {err}"))),
            Err(_) => return Err(WarpError::gpu_draw("readback map callback dropped")),
        }

        let unpadded = out_w as usize * 4;
        let padded = self.padded_bytes_per_row as usize;
        let mut out = vec![0_u8; unpadded * out_h as usize];
        {
            let mapped = slice.get_mapped_range();
            for row in 0..out_h as usize {
                let src_offset = row * padded;
                let dst_offset = row * unpadded;
                out[dst_offset..dst_offset + unpadded]
                    .copy_from_slice(&mapped[src_offset..src_offset + unpadded]);
            }
        }
        self.readback.unmap();

        RgbaImage::from_raw(out_w, out_h, out)
            .ok_or_else(|| WarpError::gpu_draw("readback size mismatch"))
    }
}

impl Drop for GpuWarpPipeline {
    fn drop(&mut self) {
        self.source_texture.destroy();
        self.target_texture.destroy();
        self.vertex_buffer.destroy();
        self.params_buffer.destroy();
        self.readback.destroy();
        tracing::debug!(source = self.source_id, "gpu warp pipeline released");
    }
}

/// Uniform block: output size, source size, then corners A..D.
fn warp_params(quad: &Quad, source_size: (u32, u32), result: ResultSpec) -> [f32; 12] {
    let corners = quad.to_uniform();
    let mut params = [0.0_f32; 12];
    params[0] = result.width as f32;
    params[1] = result.height as f32;
    params[2] = source_size.0 as f32;
    params[3] = source_size.1 as f32;
    params[4..].copy_from_slice(&corners);
    params
}

fn result_extent(result: ResultSpec) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: result.width,
        height: result.height,
        depth_or_array_layers: 1,
    }
}

fn padded_row_bytes(width: u32) -> u32 {
    let unpadded = width.saturating_mul(4);
    unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
}

fn warp_layout_entries() -> [wgpu::BindGroupLayoutEntry; 3] {
    [
        wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: 2,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        },
    ]
}

fn gpu_context() -> Option<&'static GpuContext> {
    GPU_CONTEXT.get_or_init(init_gpu_context).as_ref()
}

fn init_gpu_context() -> Option<GpuContext> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        force_fallback_adapter: false,
        compatible_surface: None,
    }))?;

    let adapter_info = adapter.get_info();
    let adapter_name = adapter_info.name;
    let adapter_backend = adapter_info.backend.to_string();
    let adapter_driver = if adapter_info.driver.trim().is_empty() {
        "unknown".to_string()
    } else {
        adapter_info.driver
    };

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("quad_warp_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::Performance,
        },
        None,
    ))
    .ok()?;
    device.on_uncaptured_error(Box::new(|err: wgpu::Error| {
        tracing::error!("uncaptured gpu error: {err}");
    }));

    tracing::info!(
        adapter = %adapter_name,
        backend = %adapter_backend,
        driver = %adapter_driver,
        "gpu warp device ready"
    );

    Some(GpuContext {
        device,
        queue,
        adapter_name,
        adapter_backend,
        adapter_driver,
    })
}

fn report_gpu_fallback_once() {
    if !GPU_FALLBACK_REPORTED.swap(true, Ordering::Relaxed) {
        tracing::warn!("gpu warp unavailable; preview stays on the cpu worker pool");
    }
}

fn f32s_as_bytes(values: &[f32]) -> &[u8] {
    // f32 has no invalid bit patterns; reinterpreting as bytes is safe.
    unsafe {
        std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), std::mem::size_of_val(values))
    }
}

// Fragment (u, v) comes from the floored pixel position so the lookup matches
// the CPU kernel texel for texel; clamp-to-edge handles out-of-range corners.
const WARP_SHADER_SRC: &str = r#"
const SNAP_EPS: f32 = 0.001;

struct WarpParams {
    out_res: vec2<f32>,
    src_res: vec2<f32>,
    a: vec2<f32>,
    b: vec2<f32>,
    c: vec2<f32>,
    d: vec2<f32>,
};

@group(0) @binding(0)
var<uniform> params: WarpParams;

@group(0) @binding(1)
var src_tex: texture_2d<f32>;

@group(0) @binding(2)
var src_sampler: sampler;

struct VertexOut {
    @builtin(position) position: vec4<f32>,
};

@vertex
fn vs_main(@location(0) pixel: vec2<f32>) -> VertexOut {
    let clip = pixel / params.out_res * 2.0 - vec2<f32>(1.0, 1.0);
    var out: VertexOut;
    out.position = vec4<f32>(clip.x, -clip.y, 0.0, 1.0);
    return out;
}

fn bilinear_sample(u: f32, v: f32) -> vec2<f32> {
    let ab = params.a + (params.b - params.a) * u;
    let dc = params.d + (params.c - params.d) * u;
    return ab + (dc - ab) * v;
}

@fragment
fn fs_main(frag: VertexOut) -> @location(0) vec4<f32> {
    let uv = floor(frag.position.xy) / params.out_res;
    let texel = floor(bilinear_sample(uv.x, uv.y) + vec2<f32>(SNAP_EPS, SNAP_EPS));
    let coord = (texel + vec2<f32>(0.5, 0.5)) / params.src_res;
    return textureSampleLevel(src_tex, src_sampler, coord, 0.0);
}
"#;
