//! `wgpu` implementation of [`RenderBackend`].
//!
//! - One WGSL module (`shaders/paint_shop.wgsl`), one render pipeline per technique.
//! - Every image is `Rgba8Unorm` and usable as sampled input, render target and copy source.
//! - Unbound inputs are backed by a shared 1×1 white texture.
//! - Readback pads rows to `COPY_BYTES_PER_ROW_ALIGNMENT` and blocks on `device.poll`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::{
    BackendStats, BufferId, BufferUsage, DrawCall, ImageId, RenderBackend, StatCounters,
    Technique, MAX_INPUTS,
};
use crate::error::{Error, Result};

const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

struct WgpuImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

#[derive(Default)]
struct WgpuState {
    images: HashMap<ImageId, WgpuImage>,
    buffers: HashMap<BufferId, wgpu::Buffer>,
}

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    layout: wgpu::BindGroupLayout,
    pipelines: HashMap<Technique, wgpu::RenderPipeline>,
    clamp_sampler: wgpu::Sampler,
    wrap_sampler: wgpu::Sampler,
    white: WgpuImage,
    state: Mutex<WgpuState>,
    stats: StatCounters,
}

impl WgpuBackend {
    /// Build on an existing device (the viewport host's).
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("paint_shop_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/paint_shop.wgsl").into()),
        });

        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let sampler_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        };

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("paint_shop_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(1),
                texture_entry(2),
                texture_entry(3),
                texture_entry(4),
                sampler_entry(5),
                sampler_entry(6),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("paint_shop_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipelines = Technique::ALL
            .iter()
            .map(|&technique| {
                let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(technique.name()),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &shader,
                        entry_point: "vs_fullscreen",
                        buffers: &[],
                        compilation_options: Default::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &shader,
                        entry_point: technique.entry_point(),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: FORMAT,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: Default::default(),
                    }),
                    primitive: wgpu::PrimitiveState::default(),
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                });
                (technique, pipeline)
            })
            .collect();

        let sampler = |label: &str, mode: wgpu::AddressMode| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: mode,
                address_mode_v: mode,
                address_mode_w: mode,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            })
        };
        let clamp_sampler = sampler("paint_shop_clamp", wgpu::AddressMode::ClampToEdge);
        let wrap_sampler = sampler("paint_shop_wrap", wgpu::AddressMode::Repeat);

        let white = upload_texture(
            &device,
            &queue,
            &RgbaImage::from_pixel(1, 1, image::Rgba([255; 4])),
            "paint_shop_white",
        );

        Self {
            device,
            queue,
            layout,
            pipelines,
            clamp_sampler,
            wrap_sampler,
            white,
            state: Mutex::new(WgpuState::default()),
            stats: StatCounters::default(),
        }
    }

    /// Create a private headless device (bakes, tools, tests with a GPU).
    pub async fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            dx12_shader_compiler: Default::default(),
            flags: wgpu::InstanceFlags::empty(),
            gles_minor_version: wgpu::Gles3MinorVersion::Automatic,
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::gpu("no compatible adapter"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("livery_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::gpu(format!("request_device failed: {e}")))?;

        log::info!("Headless GPU device on {}", adapter.get_info().name);
        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn new_headless_blocking() -> Result<Self> {
        pollster::block_on(Self::new_headless())
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    fn insert_image(&self, image: WgpuImage, uploaded: bool) -> ImageId {
        let id = ImageId(self.stats.next_id());
        self.state.lock().images.insert(id, image);
        self.stats.image_created(uploaded);
        id
    }
}

fn create_texture(device: &wgpu::Device, width: u32, height: u32, label: &str) -> WgpuImage {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    WgpuImage {
        texture,
        view,
        width,
        height,
    }
}

fn upload_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pixels: &RgbaImage,
    label: &str,
) -> WgpuImage {
    let (width, height) = pixels.dimensions();
    let image = create_texture(device, width, height, label);
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &image.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        pixels.as_raw(),
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(4 * width),
            rows_per_image: Some(height),
        },
        image.texture.size(),
    );
    image
}

impl RenderBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_image(&self, pixels: &RgbaImage, label: &str) -> Result<ImageId> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(Error::gpu(format!("cannot upload empty image `{label}`")));
        }
        let image = upload_texture(&self.device, &self.queue, pixels, label);
        Ok(self.insert_image(image, true))
    }

    fn create_target(&self, width: u32, height: u32, label: &str) -> Result<ImageId> {
        if width == 0 || height == 0 {
            return Err(Error::gpu(format!("zero-sized target `{label}`")));
        }
        let image = create_texture(&self.device, width, height, label);
        Ok(self.insert_image(image, false))
    }

    fn image_size(&self, id: ImageId) -> Option<(u32, u32)> {
        self.state
            .lock()
            .images
            .get(&id)
            .map(|img| (img.width, img.height))
    }

    fn draw(&self, call: &DrawCall<'_>) -> Result<()> {
        if call.inputs.iter().flatten().any(|id| *id == call.target) {
            return Err(Error::gpu("a draw cannot sample its own target"));
        }
        let pipeline = self
            .pipelines
            .get(&call.technique)
            .ok_or_else(|| Error::gpu(format!("no pipeline for {:?}", call.technique)))?;

        let state = self.state.lock();
        let target = state
            .images
            .get(&call.target)
            .ok_or_else(|| Error::gpu(format!("unknown target {:?}", call.target)))?;

        let mut views: [&wgpu::TextureView; MAX_INPUTS] = [&self.white.view; MAX_INPUTS];
        for (slot, id) in call.inputs.iter().enumerate() {
            if let Some(id) = id {
                views[slot] = &state
                    .images
                    .get(id)
                    .ok_or_else(|| Error::gpu(format!("unknown input {id:?}")))?
                    .view;
            }
        }

        let mut uniforms = *call.uniforms;
        uniforms.output_size = [target.width as f32, target.height as f32];
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("paint_shop_uniforms"),
                contents: bytemuck::bytes_of(&uniforms),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("paint_shop_bind_group"),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(views[0]),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(views[1]),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(views[2]),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(views[3]),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::Sampler(&self.clamp_sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: wgpu::BindingResource::Sampler(&self.wrap_sampler),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(call.technique.entry_point()),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(call.technique.entry_point()),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
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
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        self.stats.drew();
        Ok(())
    }

    fn read_pixels(&self, id: ImageId) -> Result<RgbaImage> {
        let state = self.state.lock();
        let image = state
            .images
            .get(&id)
            .ok_or_else(|| Error::gpu(format!("unknown image {id:?}")))?;

        let unpadded_row = 4 * image.width;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row = (unpadded_row + align - 1) / align * align;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("paint_shop_readback"),
            size: (padded_row * image.height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("paint_shop_readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                aspect: wgpu::TextureAspect::All,
                texture: &image.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(image.height),
                },
            },
            image.texture.size(),
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::gpu("readback channel closed before map completed"))?
            .map_err(|e| Error::gpu(format!("readback map failed: {e}")))?;

        let mapped = slice.get_mapped_range();
        let mut output = Vec::with_capacity((unpadded_row * image.height) as usize);
        for row in 0..image.height {
            let start = (row * padded_row) as usize;
            output.extend_from_slice(&mapped[start..start + unpadded_row as usize]);
        }
        drop(mapped);
        staging.unmap();

        self.stats.read_back();
        RgbaImage::from_raw(image.width, image.height, output)
            .ok_or_else(|| Error::gpu("readback size mismatch"))
    }

    fn create_buffer(&self, contents: &[u8], usage: BufferUsage, label: &str) -> Result<BufferId> {
        let usage = match usage {
            BufferUsage::Vertex => wgpu::BufferUsages::VERTEX,
            BufferUsage::Index => wgpu::BufferUsages::INDEX,
        };
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: usage | wgpu::BufferUsages::COPY_DST,
            });
        let id = BufferId(self.stats.next_id());
        self.state.lock().buffers.insert(id, buffer);
        self.stats.buffer_created();
        Ok(id)
    }

    fn release_image(&self, id: ImageId) {
        if let Some(image) = self.state.lock().images.remove(&id) {
            image.texture.destroy();
            self.stats.image_released();
        }
    }

    fn release_buffer(&self, id: BufferId) {
        if let Some(buffer) = self.state.lock().buffers.remove(&id) {
            buffer.destroy();
            self.stats.buffer_released();
        }
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}

impl fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WgpuBackend")
            .field("images", &state.images.len())
            .field("buffers", &state.buffers.len())
            .field("pipelines", &self.pipelines.len())
            .finish()
    }
}
