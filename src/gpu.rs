//! The gfx-hal compute evaluator.
//!
//! Tensors live in 3D single-channel float storage images. Each network gets
//! a reference-counted resource set (a layer-info buffer, a weights/biases
//! image, a descriptor set); each forward evaluation gets a reference-counted
//! pass (activations, pre-activations, and deltas images) that later
//! backpropagation and gradient-composition calls reuse. Every result owns
//! exactly one command buffer and one fence; the fence is the sole readiness
//! signal.
//!
//! Kernel math ships as SPIR-V supplied through [`ShaderSet`]; reference GLSL
//! lives in the `shaders/` directory of this crate.

pub mod context;
pub mod shader;
mod alloc;

use crate::{
    error::{DeviceError, EvaluatorError},
    evaluator::{Evaluator, PassToken, ResultKey},
    network::{Network, NetworkId},
    util::work_groups,
    Float, Result,
};
use alloc::{DeviceBuffer, DeviceImage, COLOR_RANGE};
use anyhow::ensure;
use context::Context;
use gfx_hal::{
    buffer::{SubRange, Usage as BufferUsage},
    command::{BufferImageCopy, CommandBuffer, CommandBufferFlags, Level},
    device::Device,
    format::Aspects,
    image::{Access as ImageAccess, Extent, Layout, Offset, SubresourceLayers, Usage as ImageUsage},
    memory::{Barrier, Dependencies},
    pool::{CommandPool, CommandPoolCreateFlags},
    pso::{
        BufferDescriptorFormat, BufferDescriptorType, ComputePipelineDesc, CreationError,
        Descriptor, DescriptorPool, DescriptorPoolCreateFlags, DescriptorRangeDesc,
        DescriptorSetLayoutBinding, DescriptorSetWrite, DescriptorType, EntryPoint,
        ImageDescriptorType, PipelineStage, ShaderStageFlags, Specialization,
    },
    queue::{Queue, QueueFamilyId},
    Backend,
};
use shader::{ShaderBlob, ShaderSet};
use std::{
    collections::HashMap,
    iter::{empty, once},
    mem::{size_of, ManuallyDrop},
    sync::Arc,
};

pub use gfx_backend_vulkan::Backend as Vulkan;

/// Work group width the kernels are compiled with.
const KERNEL_SIZE: u32 = 8;
/// Descriptor pool capacity; each live pass and network costs one set.
const MAX_SETS: usize = 200;
/// Push constant block: `(layer_index: u32, delta_scalar: f32)`.
const PUSH_CONSTANT_SIZE: u32 = 8;

const GENERAL_RW: (ImageAccess, Layout) = (
    ImageAccess::from_bits_truncate(
        ImageAccess::SHADER_READ.bits() | ImageAccess::SHADER_WRITE.bits(),
    ),
    Layout::General,
);
const TRANSFER_DST: (ImageAccess, Layout) =
    (ImageAccess::TRANSFER_WRITE, Layout::TransferDstOptimal);
const TRANSFER_SRC: (ImageAccess, Layout) = (ImageAccess::TRANSFER_READ, Layout::TransferSrcOptimal);
const UNDEFINED: (ImageAccess, Layout) = (ImageAccess::empty(), Layout::Undefined);

fn image_barrier<'a, B: Backend>(
    image: &'a B::Image,
    states: std::ops::Range<(ImageAccess, Layout)>,
) -> Barrier<'a, B> {
    Barrier::Image {
        states,
        target: image,
        range: COLOR_RANGE,
        families: None,
    }
}

const fn color_layers() -> SubresourceLayers {
    SubresourceLayers {
        aspects: Aspects::COLOR,
        level: 0,
        layers: 0..1,
    }
}

#[derive(Debug)]
struct Pipelines<B: Backend> {
    evaluation: B::ComputePipeline,
    backpropagation: B::ComputePipeline,
    deltas: B::ComputePipeline,
    modules: Vec<B::ShaderModule>,
}

impl<B: Backend> Pipelines<B> {
    unsafe fn free(self, device: &B::Device) {
        device.destroy_compute_pipeline(self.evaluation);
        device.destroy_compute_pipeline(self.backpropagation);
        device.destroy_compute_pipeline(self.deltas);
        for module in self.modules {
            device.destroy_shader_module(module);
        }
    }
}

/// Device resources shared by every pass on one network.
#[derive(Debug)]
struct NetworkResources<B: Backend> {
    info_buffer: DeviceBuffer<B>,
    data_image: DeviceImage<B>,
    descriptor_set: B::DescriptorSet,
    references: u64,
}

/// Per-sample intermediates for one batched forward evaluation, shared with
/// the backprop and delta-composition calls that refer back to it.
#[derive(Debug)]
struct PassResources<B: Backend> {
    activations: DeviceImage<B>,
    z: DeviceImage<B>,
    deltas: DeviceImage<B>,
    descriptor_set: B::DescriptorSet,
    references: u64,
    run_count: usize,
    network: NetworkId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Eval,
    Backprop,
}

#[derive(Debug)]
struct GpuResult<B: Backend> {
    kind: ResultKind,
    pass: u64,
    command_buffer: B::CommandBuffer,
    fence: B::Fence,
    staging: Vec<DeviceBuffer<B>>,
}

/// Configures and builds a [`GpuEvaluator`].
///
/// Collaborators that already own a device (the debug viewer, typically)
/// pass their [`Context`] in; every field the context carries skips internal
/// creation, and shared ownership through [`Arc`] means the evaluator never
/// destroys objects it did not create.
pub struct GpuBuilder<B: Backend = Vulkan> {
    name: String,
    shaders: Option<ShaderSet>,
    shared_context: Option<Arc<Context<B>>>,
    extra_image_usage: ImageUsage,
    shared_families: Vec<QueueFamilyId>,
    device_chosen: Option<Box<dyn FnMut(&Context<B>)>>,
    init_finished: Option<Box<dyn FnMut()>>,
}

impl<B: Backend> Default for GpuBuilder<B> {
    fn default() -> Self {
        Self {
            name: "neurograph".into(),
            shaders: None,
            shared_context: None,
            extra_image_usage: ImageUsage::empty(),
            shared_families: Vec::new(),
            device_chosen: None,
            init_finished: None,
        }
    }
}

impl<B: Backend> GpuBuilder<B> {
    /// Application name reported to the driver.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    /// The compiled kernels. Required.
    pub fn shaders(mut self, shaders: ShaderSet) -> Self {
        self.shaders.replace(shaders);
        self
    }
    /// Use an existing context instead of creating instance and device.
    pub fn context(mut self, context: Arc<Context<B>>) -> Self {
        self.shared_context.replace(context);
        self
    }
    /// Extra usage flags for every image the evaluator creates, for
    /// collaborators that sample or blit them.
    pub fn extra_image_usage(mut self, usage: ImageUsage) -> Self {
        self.extra_image_usage = usage;
        self
    }
    /// Additional queue families to open on the device (ignored when a
    /// context is provided).
    pub fn shared_queue_families(mut self, families: impl IntoIterator<Item = QueueFamilyId>) -> Self {
        self.shared_families.extend(families);
        self
    }
    /// Called once the device is selected, before any engine objects exist.
    pub fn device_chosen(mut self, callback: impl FnMut(&Context<B>) + 'static) -> Self {
        self.device_chosen.replace(Box::new(callback));
        self
    }
    /// Called when initialization is complete.
    pub fn init_finished(mut self, callback: impl FnMut() + 'static) -> Self {
        self.init_finished.replace(Box::new(callback));
        self
    }

    pub fn build(self) -> Result<GpuEvaluator<B>> {
        let Self {
            name,
            shaders,
            shared_context,
            extra_image_usage,
            shared_families,
            mut device_chosen,
            mut init_finished,
        } = self;
        let shaders =
            shaders.ok_or_else(|| anyhow::anyhow!("a shader set is required to build the GPU evaluator"))?;
        let context = match shared_context {
            Some(context) => context,
            None => Arc::new(Context::create(&name, &shared_families, extra_image_usage)?),
        };
        if let Some(callback) = device_chosen.as_mut() {
            callback(&context);
        }
        let evaluator = GpuEvaluator::from_context(context, &shaders)?;
        if let Some(callback) = init_finished.as_mut() {
            callback();
        }
        Ok(evaluator)
    }
}

impl<B: Backend> std::fmt::Debug for GpuBuilder<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GpuBuilder")
            .field("name", &self.name)
            .field("has_shaders", &self.shaders.is_some())
            .field("has_context", &self.shared_context.is_some())
            .finish()
    }
}

/// Asynchronous [`Evaluator`] running on a gfx-hal compute device.
#[derive(Debug)]
pub struct GpuEvaluator<B: Backend = Vulkan> {
    context: Arc<Context<B>>,
    command_pool: ManuallyDrop<B::CommandPool>,
    descriptor_pool: ManuallyDrop<B::DescriptorPool>,
    evaluation_layout: ManuallyDrop<B::DescriptorSetLayout>,
    network_layout: ManuallyDrop<B::DescriptorSetLayout>,
    pipeline_layout: ManuallyDrop<B::PipelineLayout>,
    pipelines: ManuallyDrop<Pipelines<B>>,
    networks: HashMap<NetworkId, NetworkResources<B>>,
    passes: HashMap<u64, PassResources<B>>,
    results: HashMap<u64, GpuResult<B>>,
    next_pass: u64,
    next_result: u64,
    training: bool,
}

impl GpuEvaluator<Vulkan> {
    /// Builds an evaluator on the best available Vulkan device.
    pub fn new(shaders: ShaderSet) -> Result<Self> {
        GpuBuilder::default().shaders(shaders).build()
    }
}

impl<B: Backend> GpuEvaluator<B> {
    pub fn builder() -> GpuBuilder<B> {
        GpuBuilder::default()
    }

    pub fn context(&self) -> &Arc<Context<B>> {
        &self.context
    }

    /// Number of live passes. Diagnostic.
    pub fn outstanding_passes(&self) -> usize {
        self.passes.len()
    }

    /// Number of results not yet freed. Diagnostic.
    pub fn outstanding_results(&self) -> usize {
        self.results.len()
    }

    /// Reference count currently held for `nn`, zero when no device
    /// resources are bound to it.
    pub fn network_references(&self, nn: &Network) -> u64 {
        self.networks.get(&nn.id()).map_or(0, |n| n.references)
    }

    fn from_context(context: Arc<Context<B>>, shaders: &ShaderSet) -> Result<Self> {
        let device = context.device();
        // Reset-per-buffer lets freed result command buffers recycle without
        // resetting the whole pool.
        let command_pool = unsafe {
            device
                .create_command_pool(context.compute_family(), CommandPoolCreateFlags::RESET_INDIVIDUAL)
                .map_err(DeviceError::from)?
        };
        // Evaluation sets bind three storage images, network sets one storage
        // buffer and one storage image; size the pool for the worst case.
        let ranges = [
            DescriptorRangeDesc {
                ty: DescriptorType::Image {
                    ty: ImageDescriptorType::Storage { read_only: false },
                },
                count: MAX_SETS * 4,
            },
            DescriptorRangeDesc {
                ty: DescriptorType::Buffer {
                    ty: BufferDescriptorType::Storage { read_only: true },
                    format: BufferDescriptorFormat::Structured {
                        dynamic_offset: false,
                    },
                },
                count: MAX_SETS,
            },
        ];
        let descriptor_pool = match unsafe {
            device.create_descriptor_pool(
                MAX_SETS,
                ranges.into_iter(),
                DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            )
        } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { device.destroy_command_pool(command_pool) };
                return Err(DeviceError::from(err).into());
            }
        };
        let built = Self::create_layouts_and_pipelines(device, shaders);
        let (evaluation_layout, network_layout, pipeline_layout, pipelines) = match built {
            Ok(objects) => objects,
            Err(err) => {
                unsafe {
                    device.destroy_descriptor_pool(descriptor_pool);
                    device.destroy_command_pool(command_pool);
                }
                return Err(err.into());
            }
        };
        log::debug!(
            "gpu evaluator ready on \"{}\" (queue family {:?})",
            context.adapter_name(),
            context.compute_family()
        );
        Ok(Self {
            context,
            command_pool: ManuallyDrop::new(command_pool),
            descriptor_pool: ManuallyDrop::new(descriptor_pool),
            evaluation_layout: ManuallyDrop::new(evaluation_layout),
            network_layout: ManuallyDrop::new(network_layout),
            pipeline_layout: ManuallyDrop::new(pipeline_layout),
            pipelines: ManuallyDrop::new(pipelines),
            networks: HashMap::new(),
            passes: HashMap::new(),
            results: HashMap::new(),
            next_pass: 0,
            next_result: 0,
            training: false,
        })
    }

    #[allow(clippy::type_complexity)]
    fn create_layouts_and_pipelines(
        device: &B::Device,
        shaders: &ShaderSet,
    ) -> Result<
        (
            B::DescriptorSetLayout,
            B::DescriptorSetLayout,
            B::PipelineLayout,
            Pipelines<B>,
        ),
        DeviceError,
    > {
        let storage_image = |binding| DescriptorSetLayoutBinding {
            binding,
            ty: DescriptorType::Image {
                ty: ImageDescriptorType::Storage { read_only: false },
            },
            count: 1,
            stage_flags: ShaderStageFlags::COMPUTE,
            immutable_samplers: false,
        };
        let evaluation_bindings = [storage_image(0), storage_image(1), storage_image(2)];
        let network_bindings = [
            DescriptorSetLayoutBinding {
                binding: 0,
                ty: DescriptorType::Buffer {
                    ty: BufferDescriptorType::Storage { read_only: true },
                    format: BufferDescriptorFormat::Structured {
                        dynamic_offset: false,
                    },
                },
                count: 1,
                stage_flags: ShaderStageFlags::COMPUTE,
                immutable_samplers: false,
            },
            storage_image(1),
        ];
        let evaluation_layout = unsafe {
            device.create_descriptor_set_layout(evaluation_bindings.into_iter(), empty())?
        };
        let network_layout = match unsafe {
            device.create_descriptor_set_layout(network_bindings.into_iter(), empty())
        } {
            Ok(layout) => layout,
            Err(err) => {
                unsafe { device.destroy_descriptor_set_layout(evaluation_layout) };
                return Err(err.into());
            }
        };
        let pipeline_layout = match unsafe {
            device.create_pipeline_layout(
                [&evaluation_layout, &network_layout].into_iter(),
                once((ShaderStageFlags::COMPUTE, 0..PUSH_CONSTANT_SIZE)),
            )
        } {
            Ok(layout) => layout,
            Err(err) => {
                unsafe {
                    device.destroy_descriptor_set_layout(network_layout);
                    device.destroy_descriptor_set_layout(evaluation_layout);
                }
                return Err(err.into());
            }
        };
        let mut modules = Vec::with_capacity(3);
        let mut built: Vec<B::ComputePipeline> = Vec::with_capacity(3);
        let sources: [(&'static str, &ShaderBlob); 3] = [
            ("evaluation", shaders.evaluation()),
            ("backpropagation", shaders.backpropagation()),
            ("deltas", shaders.deltas()),
        ];
        for (name, blob) in sources {
            match Self::create_pipeline(device, &pipeline_layout, name, blob) {
                Ok((module, pipeline)) => {
                    modules.push(module);
                    built.push(pipeline);
                }
                Err(err) => {
                    unsafe {
                        for pipeline in built {
                            device.destroy_compute_pipeline(pipeline);
                        }
                        for module in modules {
                            device.destroy_shader_module(module);
                        }
                        device.destroy_pipeline_layout(pipeline_layout);
                        device.destroy_descriptor_set_layout(network_layout);
                        device.destroy_descriptor_set_layout(evaluation_layout);
                    }
                    return Err(err);
                }
            }
        }
        let mut built = built.into_iter();
        let pipelines = Pipelines {
            evaluation: built.next().expect("three pipelines"),
            backpropagation: built.next().expect("three pipelines"),
            deltas: built.next().expect("three pipelines"),
            modules,
        };
        Ok((evaluation_layout, network_layout, pipeline_layout, pipelines))
    }

    fn create_pipeline(
        device: &B::Device,
        layout: &B::PipelineLayout,
        name: &'static str,
        blob: &ShaderBlob,
    ) -> Result<(B::ShaderModule, B::ComputePipeline), DeviceError> {
        let module = unsafe {
            device
                .create_shader_module(blob.words())
                .map_err(|_| DeviceError::ShaderCompilationFailed(name))?
        };
        let entry_point = EntryPoint {
            entry: "main",
            module: &module,
            specialization: Specialization::default(),
        };
        let pipeline = unsafe {
            device.create_compute_pipeline(&ComputePipelineDesc::new(entry_point, layout), None)
        };
        match pipeline {
            Ok(pipeline) => Ok((module, pipeline)),
            Err(err) => {
                unsafe { device.destroy_shader_module(module) };
                match err {
                    CreationError::OutOfMemory(oom) => Err(oom.into()),
                    _ => Err(DeviceError::ShaderCompilationFailed(name)),
                }
            }
        }
    }

    /// Records, submits, and synchronously waits out a transient command
    /// buffer.
    fn one_shot(
        context: &Context<B>,
        command_pool: &mut B::CommandPool,
        record: impl FnOnce(&mut B::CommandBuffer),
    ) -> Result<(), DeviceError> {
        let device = context.device();
        let mut command_buffer = unsafe { command_pool.allocate_one(Level::Primary) };
        unsafe {
            command_buffer.begin_primary(CommandBufferFlags::ONE_TIME_SUBMIT);
        }
        record(&mut command_buffer);
        unsafe {
            command_buffer.finish();
        }
        let mut fence = match device.create_fence(false) {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { command_pool.free(once(command_buffer)) };
                return Err(err.into());
            }
        };
        unsafe {
            let mut queue = context.queue();
            queue.submit(
                once(&command_buffer),
                empty::<(&B::Semaphore, PipelineStage)>(),
                empty::<&B::Semaphore>(),
                Some(&mut fence),
            );
        }
        let waited = unsafe { device.wait_for_fence(&fence, u64::MAX) };
        unsafe {
            device.destroy_fence(fence);
            command_pool.free(once(command_buffer));
        }
        match waited {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeviceError::DeviceLost),
            Err(err) => Err(err.into()),
        }
    }

    /// Binds device resources to `nn`, or bumps the count when they already
    /// exist. The first reference uploads layer metadata and the weight/bias
    /// tensor.
    fn add_network_reference(&mut self, nn: &Network) -> Result<(), DeviceError> {
        if let Some(resources) = self.networks.get_mut(&nn.id()) {
            resources.references += 1;
            return Ok(());
        }
        let context = self.context.clone();
        let device = context.device();
        let memory_properties = context.memory_properties();
        let layers = nn.layers();
        let max_previous = layers.iter().map(|l| l.previous_size).max().unwrap_or(0);
        let max_size = layers.iter().map(|l| l.size).max().unwrap_or(0);
        let extent = Extent {
            width: max_previous as u32 + 1,
            height: max_size as u32,
            depth: layers.len() as u32,
        };

        let mut info: Vec<u32> = Vec::with_capacity(layers.len() * 3);
        for layer in layers {
            info.extend_from_slice(&[
                layer.size as u32,
                layer.previous_size as u32,
                layer.function.tag(),
            ]);
        }
        let info_buffer = DeviceBuffer::staging(
            device,
            memory_properties,
            BufferUsage::STORAGE,
            bytemuck::cast_slice(&info),
        )?;

        // Column 0 carries the biases, columns 1..=previous_size the weights;
        // one tightly packed region per layer slice.
        let mut payload: Vec<Float> = Vec::new();
        let mut regions = Vec::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            let row_len = layer.previous_size + 1;
            let buffer_offset = (payload.len() * size_of::<Float>()) as u64;
            for c in 0..layer.size {
                payload.push(layer.bias(c));
                for p in 0..layer.previous_size {
                    payload.push(layer.weight(c, p));
                }
            }
            regions.push(BufferImageCopy {
                buffer_offset,
                buffer_width: row_len as u32,
                buffer_height: layer.size as u32,
                image_layers: color_layers(),
                image_offset: Offset {
                    x: 0,
                    y: 0,
                    z: i as i32,
                },
                image_extent: Extent {
                    width: row_len as u32,
                    height: layer.size as u32,
                    depth: 1,
                },
            });
        }
        let staging: DeviceBuffer<B> = match DeviceBuffer::staging(
            device,
            memory_properties,
            BufferUsage::TRANSFER_SRC,
            bytemuck::cast_slice(&payload),
        ) {
            Ok(staging) => staging,
            Err(err) => {
                unsafe { info_buffer.free(device) };
                return Err(err);
            }
        };
        let usage = ImageUsage::STORAGE
            | ImageUsage::TRANSFER_SRC
            | ImageUsage::TRANSFER_DST
            | context.extra_image_usage();
        let data_image = match DeviceImage::new(device, memory_properties, extent, usage) {
            Ok(image) => image,
            Err(err) => {
                unsafe {
                    staging.free(device);
                    info_buffer.free(device);
                }
                return Err(err);
            }
        };

        let upload = Self::one_shot(&context, &mut self.command_pool, |cb| unsafe {
            cb.pipeline_barrier(
                PipelineStage::TOP_OF_PIPE..PipelineStage::TRANSFER,
                Dependencies::empty(),
                once(image_barrier::<B>(data_image.image(), UNDEFINED..TRANSFER_DST)),
            );
            cb.copy_buffer_to_image(
                staging.buffer(),
                data_image.image(),
                Layout::TransferDstOptimal,
                regions.into_iter(),
            );
            cb.pipeline_barrier(
                PipelineStage::TRANSFER..PipelineStage::COMPUTE_SHADER,
                Dependencies::empty(),
                once(image_barrier::<B>(data_image.image(), TRANSFER_DST..GENERAL_RW)),
            );
        });
        unsafe { staging.free(device) };
        if let Err(err) = upload {
            unsafe {
                data_image.free(device);
                info_buffer.free(device);
            }
            return Err(err);
        }

        let mut descriptor_set = match unsafe { self.descriptor_pool.allocate_one(&self.network_layout) }
        {
            Ok(set) => set,
            Err(err) => {
                unsafe {
                    data_image.free(device);
                    info_buffer.free(device);
                }
                return Err(err.into());
            }
        };
        unsafe {
            device.write_descriptor_set(DescriptorSetWrite {
                set: &mut descriptor_set,
                binding: 0,
                array_offset: 0,
                descriptors: once(Descriptor::Buffer(info_buffer.buffer(), SubRange::WHOLE)),
            });
            device.write_descriptor_set(DescriptorSetWrite {
                set: &mut descriptor_set,
                binding: 1,
                array_offset: 0,
                descriptors: once(Descriptor::Image(data_image.view(), Layout::General)),
            });
        }
        log::debug!(
            "bound network {:?}: {} layers, tensor {}x{}x{}",
            nn.id(),
            layers.len(),
            extent.width,
            extent.height,
            extent.depth
        );
        self.networks.insert(
            nn.id(),
            NetworkResources {
                info_buffer,
                data_image,
                descriptor_set,
                references: 1,
            },
        );
        Ok(())
    }

    fn remove_network_reference(&mut self, id: NetworkId) {
        let free = match self.networks.get_mut(&id) {
            Some(resources) => {
                resources.references = resources.references.saturating_sub(1);
                // Training mode pins the binding so the next batch does not
                // re-upload the whole network.
                resources.references == 0 && !self.training
            }
            None => false,
        };
        if free {
            self.free_network(id);
        }
    }

    fn free_network(&mut self, id: NetworkId) {
        if let Some(resources) = self.networks.remove(&id) {
            let context = self.context.clone();
            let device = context.device();
            unsafe {
                resources.info_buffer.free(device);
                resources.data_image.free(device);
                self.descriptor_pool.free(once(resources.descriptor_set));
            }
        }
    }

    /// Allocates pass images for `run_count` samples, uploads the input batch
    /// into activations row 0, and leaves every image in the general layout.
    fn new_pass(&mut self, nn: &Network, inputs: &[Float], run_count: usize) -> Result<u64, DeviceError> {
        let context = self.context.clone();
        let device = context.device();
        let memory_properties = context.memory_properties();
        let layers = nn.layers();
        let layer_count = layers.len() as u32;
        let input_count = nn.input_count();
        let max_neurons = layers
            .iter()
            .map(|l| l.size)
            .chain(once(input_count))
            .max()
            .unwrap_or(0) as u32;
        let network = self.networks.get(&nn.id()).expect("network bound before pass");
        let network_extent = network.data_image.extent();
        let usage = ImageUsage::STORAGE
            | ImageUsage::TRANSFER_SRC
            | ImageUsage::TRANSFER_DST
            | context.extra_image_usage();

        // Row 0 holds the inputs, rows 1..=layer_count the activations, and
        // the final row the expected outputs uploaded by backprop.
        let activations = DeviceImage::new(
            device,
            memory_properties,
            Extent {
                width: max_neurons,
                height: layer_count + 2,
                depth: run_count as u32,
            },
            usage,
        )?;
        let z = match DeviceImage::new(
            device,
            memory_properties,
            Extent {
                width: max_neurons,
                height: layer_count,
                depth: run_count as u32,
            },
            usage,
        ) {
            Ok(image) => image,
            Err(err) => {
                unsafe { activations.free(device) };
                return Err(err);
            }
        };
        let deltas = match DeviceImage::new(
            device,
            memory_properties,
            Extent {
                width: network_extent.width,
                height: network_extent.height,
                depth: network_extent.depth * run_count as u32,
            },
            usage,
        ) {
            Ok(image) => image,
            Err(err) => {
                unsafe {
                    z.free(device);
                    activations.free(device);
                }
                return Err(err);
            }
        };

        let staging: DeviceBuffer<B> = match DeviceBuffer::staging(
            device,
            memory_properties,
            BufferUsage::TRANSFER_SRC,
            bytemuck::cast_slice(inputs),
        ) {
            Ok(staging) => staging,
            Err(err) => {
                unsafe {
                    deltas.free(device);
                    z.free(device);
                    activations.free(device);
                }
                return Err(err);
            }
        };

        let regions = (0..run_count).map(|k| BufferImageCopy {
            buffer_offset: (k * input_count * size_of::<Float>()) as u64,
            buffer_width: input_count as u32,
            buffer_height: 1,
            image_layers: color_layers(),
            image_offset: Offset {
                x: 0,
                y: 0,
                z: k as i32,
            },
            image_extent: Extent {
                width: input_count as u32,
                height: 1,
                depth: 1,
            },
        });
        let upload = Self::one_shot(&context, &mut self.command_pool, |cb| unsafe {
            cb.pipeline_barrier(
                PipelineStage::TOP_OF_PIPE..PipelineStage::TRANSFER,
                Dependencies::empty(),
                once(image_barrier::<B>(activations.image(), UNDEFINED..TRANSFER_DST)),
            );
            cb.pipeline_barrier(
                PipelineStage::TOP_OF_PIPE..PipelineStage::COMPUTE_SHADER,
                Dependencies::empty(),
                [
                    image_barrier::<B>(z.image(), UNDEFINED..GENERAL_RW),
                    image_barrier::<B>(deltas.image(), UNDEFINED..GENERAL_RW),
                ]
                .into_iter(),
            );
            cb.copy_buffer_to_image(
                staging.buffer(),
                activations.image(),
                Layout::TransferDstOptimal,
                regions,
            );
            cb.pipeline_barrier(
                PipelineStage::TRANSFER..PipelineStage::COMPUTE_SHADER,
                Dependencies::empty(),
                once(image_barrier::<B>(activations.image(), TRANSFER_DST..GENERAL_RW)),
            );
        });
        unsafe { staging.free(device) };
        if let Err(err) = upload {
            unsafe {
                deltas.free(device);
                z.free(device);
                activations.free(device);
            }
            return Err(err);
        }

        let mut descriptor_set =
            match unsafe { self.descriptor_pool.allocate_one(&self.evaluation_layout) } {
                Ok(set) => set,
                Err(err) => {
                    unsafe {
                        deltas.free(device);
                        z.free(device);
                        activations.free(device);
                    }
                    return Err(err.into());
                }
            };
        unsafe {
            for (binding, view) in [activations.view(), z.view(), deltas.view()]
                .into_iter()
                .enumerate()
            {
                device.write_descriptor_set(DescriptorSetWrite {
                    set: &mut descriptor_set,
                    binding: binding as u32,
                    array_offset: 0,
                    descriptors: once(Descriptor::Image(view, Layout::General)),
                });
            }
        }

        let pass_id = self.next_pass;
        self.next_pass += 1;
        self.passes.insert(
            pass_id,
            PassResources {
                activations,
                z,
                deltas,
                descriptor_set,
                references: 1,
                run_count,
                network: nn.id(),
            },
        );
        Ok(pass_id)
    }

    fn remove_pass_reference(&mut self, pass_id: u64) {
        let free = match self.passes.get_mut(&pass_id) {
            Some(pass) => {
                pass.references = pass.references.saturating_sub(1);
                pass.references == 0
            }
            None => false,
        };
        if free {
            let pass = self.passes.remove(&pass_id).expect("checked above");
            let context = self.context.clone();
            let device = context.device();
            unsafe {
                pass.activations.free(device);
                pass.z.free(device);
                pass.deltas.free(device);
                self.descriptor_pool.free(once(pass.descriptor_set));
            }
            self.remove_network_reference(pass.network);
        }
    }

    fn next_result_key(&mut self) -> ResultKey {
        let key = self.next_result;
        self.next_result += 1;
        ResultKey(key)
    }

    fn fence_status(&self, result: &GpuResult<B>) -> Result<bool, DeviceError> {
        unsafe {
            self.context
                .device()
                .get_fence_status(&result.fence)
                .map_err(DeviceError::from)
        }
    }
}

impl<B: Backend> Evaluator for GpuEvaluator<B> {
    fn is_result_ready(&self, key: ResultKey) -> bool {
        match self.results.get(&key.0) {
            Some(result) => self.fence_status(result).unwrap_or(false),
            None => false,
        }
    }

    fn free_result(&mut self, key: ResultKey) -> Result<()> {
        let result = self
            .results
            .get(&key.0)
            .ok_or(EvaluatorError::UnknownResult(key))?;
        ensure!(
            self.fence_status(result)?,
            EvaluatorError::ResultNotReady(key)
        );
        let result = self.results.remove(&key.0).expect("checked above");
        let context = self.context.clone();
        let device = context.device();
        unsafe {
            device.destroy_fence(result.fence);
            self.command_pool.free(once(result.command_buffer));
            for staging in result.staging {
                staging.free(device);
            }
        }
        self.remove_pass_reference(result.pass);
        Ok(())
    }

    fn begin_eval(&mut self, nn: &Network, inputs: &[Float]) -> Result<ResultKey> {
        ensure!(!nn.layers().is_empty(), EvaluatorError::EmptyNetwork);
        let input_count = nn.input_count();
        ensure!(
            !inputs.is_empty() && inputs.len() % input_count == 0,
            EvaluatorError::InputSize {
                len: inputs.len(),
                input_count,
            }
        );
        let run_count = inputs.len() / input_count;
        self.add_network_reference(nn)?;
        let pass_id = match self.new_pass(nn, inputs, run_count) {
            Ok(pass_id) => pass_id,
            Err(err) => {
                self.remove_network_reference(nn.id());
                return Err(err.into());
            }
        };

        let pass = &self.passes[&pass_id];
        let network = &self.networks[&nn.id()];
        let layers = nn.layers();
        let context = self.context.clone();
        let device = context.device();
        let mut command_buffer = unsafe { self.command_pool.allocate_one(Level::Primary) };
        unsafe {
            command_buffer.begin_primary(CommandBufferFlags::ONE_TIME_SUBMIT);
            command_buffer.bind_compute_pipeline(&self.pipelines.evaluation);
            command_buffer.bind_compute_descriptor_sets(
                &self.pipeline_layout,
                0,
                [&pass.descriptor_set, &network.descriptor_set].into_iter(),
                empty(),
            );
            for (i, layer) in layers.iter().enumerate() {
                if i > 0 {
                    // Layer i reads the activations row layer i-1 just wrote.
                    command_buffer.pipeline_barrier(
                        PipelineStage::COMPUTE_SHADER..PipelineStage::COMPUTE_SHADER,
                        Dependencies::empty(),
                        [
                            image_barrier::<B>(pass.activations.image(), GENERAL_RW..GENERAL_RW),
                            image_barrier::<B>(pass.z.image(), GENERAL_RW..GENERAL_RW),
                        ]
                        .into_iter(),
                    );
                }
                command_buffer.push_compute_constants(
                    &self.pipeline_layout,
                    0,
                    &[i as u32, 0f32.to_bits()],
                );
                command_buffer.dispatch([
                    work_groups(layer.size as u32, KERNEL_SIZE),
                    work_groups(run_count as u32, KERNEL_SIZE),
                    1,
                ]);
            }
            command_buffer.finish();
        }
        let mut fence = match device.create_fence(false) {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { self.command_pool.free(once(command_buffer)) };
                self.remove_pass_reference(pass_id);
                return Err(DeviceError::from(err).into());
            }
        };
        unsafe {
            let mut queue = context.queue();
            queue.submit(
                once(&command_buffer),
                empty::<(&B::Semaphore, PipelineStage)>(),
                empty::<&B::Semaphore>(),
                Some(&mut fence),
            );
        }
        let key = self.next_result_key();
        self.results.insert(
            key.0,
            GpuResult {
                kind: ResultKind::Eval,
                pass: pass_id,
                command_buffer,
                fence,
                staging: Vec::new(),
            },
        );
        Ok(key)
    }

    fn eval_pass(&self, key: ResultKey) -> Result<PassToken> {
        let result = self
            .results
            .get(&key.0)
            .ok_or(EvaluatorError::UnknownResult(key))?;
        ensure!(
            result.kind == ResultKind::Eval,
            EvaluatorError::NotAnEvalResult(key)
        );
        let pass = self
            .passes
            .get(&result.pass)
            .ok_or(EvaluatorError::UnknownPass)?;
        Ok(PassToken {
            pass: result.pass,
            network: pass.network,
        })
    }

    fn eval_outputs(&mut self, nn: &Network, pass: PassToken, outputs: &mut Vec<Float>) -> Result<()> {
        ensure!(pass.network == nn.id(), EvaluatorError::NetworkMismatch);
        let resources = self
            .passes
            .get(&pass.pass)
            .ok_or(EvaluatorError::UnknownPass)?;
        let run_count = resources.run_count;
        let output_count = nn.output_count();
        let layer_count = nn.layers().len();
        let context = self.context.clone();
        let device = context.device();
        let mut readback = DeviceBuffer::<B>::new(
            device,
            context.memory_properties(),
            (run_count * output_count * size_of::<Float>()) as u64,
            BufferUsage::TRANSFER_DST,
            alloc::mapping_properties(),
        )
        .map_err(anyhow::Error::from)?;
        let regions = (0..run_count).map(|k| BufferImageCopy {
            buffer_offset: (k * output_count * size_of::<Float>()) as u64,
            buffer_width: output_count as u32,
            buffer_height: 1,
            image_layers: color_layers(),
            image_offset: Offset {
                x: 0,
                y: layer_count as i32,
                z: k as i32,
            },
            image_extent: Extent {
                width: output_count as u32,
                height: 1,
                depth: 1,
            },
        });
        let copied = Self::one_shot(&context, &mut self.command_pool, |cb| unsafe {
            cb.pipeline_barrier(
                PipelineStage::COMPUTE_SHADER..PipelineStage::TRANSFER,
                Dependencies::empty(),
                once(image_barrier::<B>(
                    resources.activations.image(),
                    GENERAL_RW..TRANSFER_SRC,
                )),
            );
            cb.copy_image_to_buffer(
                resources.activations.image(),
                Layout::TransferSrcOptimal,
                readback.buffer(),
                regions,
            );
            cb.pipeline_barrier(
                PipelineStage::TRANSFER..PipelineStage::COMPUTE_SHADER,
                Dependencies::empty(),
                once(image_barrier::<B>(
                    resources.activations.image(),
                    TRANSFER_SRC..GENERAL_RW,
                )),
            );
        });
        let values = match copied {
            Ok(()) => {
                let mut bytes = vec![0u8; run_count * output_count * size_of::<Float>()];
                let read = readback.read(device, &mut bytes);
                read.map(|_| bytes)
            }
            Err(err) => Err(err),
        };
        unsafe { readback.free(device) };
        let bytes = values.map_err(anyhow::Error::from)?;
        outputs.extend_from_slice(bytemuck::cast_slice(&bytes));
        Ok(())
    }

    fn begin_backprop(
        &mut self,
        nn: &Network,
        pass: PassToken,
        expected: &[Float],
    ) -> Result<ResultKey> {
        ensure!(!nn.layers().is_empty(), EvaluatorError::EmptyNetwork);
        ensure!(pass.network == nn.id(), EvaluatorError::NetworkMismatch);
        let resources = self
            .passes
            .get(&pass.pass)
            .ok_or(EvaluatorError::UnknownPass)?;
        let run_count = resources.run_count;
        let output_count = nn.output_count();
        let expected_len = output_count * run_count;
        ensure!(
            expected.len() == expected_len,
            EvaluatorError::ExpectedOutputSize {
                len: expected.len(),
                expected: expected_len,
                run_count,
            }
        );
        let layers = nn.layers();
        let layer_count = layers.len();
        let network = self
            .networks
            .get(&nn.id())
            .ok_or(EvaluatorError::NetworkMismatch)?;
        let context = self.context.clone();
        let device = context.device();
        let staging = DeviceBuffer::staging(
            device,
            context.memory_properties(),
            BufferUsage::TRANSFER_SRC,
            bytemuck::cast_slice(expected),
        )
        .map_err(anyhow::Error::from)?;
        let regions = (0..run_count).map(|k| BufferImageCopy {
            buffer_offset: (k * output_count * size_of::<Float>()) as u64,
            buffer_width: output_count as u32,
            buffer_height: 1,
            image_layers: color_layers(),
            image_offset: Offset {
                x: 0,
                // Expected outputs live in the last activations row.
                y: (layer_count + 1) as i32,
                z: k as i32,
            },
            image_extent: Extent {
                width: output_count as u32,
                height: 1,
                depth: 1,
            },
        });
        let mut command_buffer = unsafe { self.command_pool.allocate_one(Level::Primary) };
        unsafe {
            command_buffer.begin_primary(CommandBufferFlags::ONE_TIME_SUBMIT);
            command_buffer.pipeline_barrier(
                PipelineStage::COMPUTE_SHADER..PipelineStage::TRANSFER,
                Dependencies::empty(),
                once(image_barrier::<B>(
                    resources.activations.image(),
                    GENERAL_RW..TRANSFER_DST,
                )),
            );
            command_buffer.copy_buffer_to_image(
                staging.buffer(),
                resources.activations.image(),
                Layout::TransferDstOptimal,
                regions,
            );
            command_buffer.pipeline_barrier(
                PipelineStage::TRANSFER..PipelineStage::COMPUTE_SHADER,
                Dependencies::empty(),
                once(image_barrier::<B>(
                    resources.activations.image(),
                    TRANSFER_DST..GENERAL_RW,
                )),
            );
            command_buffer.bind_compute_pipeline(&self.pipelines.backpropagation);
            command_buffer.bind_compute_descriptor_sets(
                &self.pipeline_layout,
                0,
                [&resources.descriptor_set, &network.descriptor_set].into_iter(),
                empty(),
            );
            for (j, i) in (0..layer_count).rev().enumerate() {
                if j > 0 {
                    // Layer i reads the deltas row layer i+1 just wrote.
                    command_buffer.pipeline_barrier(
                        PipelineStage::COMPUTE_SHADER..PipelineStage::COMPUTE_SHADER,
                        Dependencies::empty(),
                        once(image_barrier::<B>(
                            resources.deltas.image(),
                            GENERAL_RW..GENERAL_RW,
                        )),
                    );
                }
                command_buffer.push_compute_constants(
                    &self.pipeline_layout,
                    0,
                    &[i as u32, 0f32.to_bits()],
                );
                command_buffer.dispatch([
                    work_groups(layers[i].size as u32, KERNEL_SIZE),
                    work_groups(run_count as u32, KERNEL_SIZE),
                    1,
                ]);
            }
            command_buffer.finish();
        }
        let mut fence = match device.create_fence(false) {
            Ok(fence) => fence,
            Err(err) => {
                unsafe {
                    self.command_pool.free(once(command_buffer));
                    staging.free(device);
                }
                return Err(DeviceError::from(err).into());
            }
        };
        unsafe {
            let mut queue = context.queue();
            queue.submit(
                once(&command_buffer),
                empty::<(&B::Semaphore, PipelineStage)>(),
                empty::<&B::Semaphore>(),
                Some(&mut fence),
            );
        }
        self.passes
            .get_mut(&pass.pass)
            .expect("pass checked above")
            .references += 1;
        let key = self.next_result_key();
        self.results.insert(
            key.0,
            GpuResult {
                kind: ResultKind::Backprop,
                pass: pass.pass,
                command_buffer,
                fence,
                staging: vec![staging],
            },
        );
        Ok(key)
    }

    fn compose_deltas(
        &mut self,
        nn: &mut Network,
        keys: &[ResultKey],
        scalar: Float,
        copy: bool,
    ) -> Result<()> {
        let mut pass_ids = Vec::with_capacity(keys.len());
        for key in keys {
            let result = self
                .results
                .get(&key.0)
                .ok_or(EvaluatorError::UnknownResult(*key))?;
            ensure!(
                result.kind == ResultKind::Backprop,
                EvaluatorError::NotABackpropResult(*key)
            );
            ensure!(
                self.fence_status(result)?,
                EvaluatorError::ResultNotReady(*key)
            );
            let pass = self
                .passes
                .get(&result.pass)
                .ok_or(EvaluatorError::UnknownPass)?;
            ensure!(pass.network == nn.id(), EvaluatorError::NetworkMismatch);
            pass_ids.push(result.pass);
        }
        let network = self
            .networks
            .get(&nn.id())
            .ok_or(EvaluatorError::NetworkMismatch)?;
        let extent = network.data_image.extent();
        let context = self.context.clone();
        let device = context.device();
        let readback = if copy {
            let size = (extent.width * extent.height * extent.depth) as usize * size_of::<Float>();
            Some(
                DeviceBuffer::<B>::new(
                    device,
                    context.memory_properties(),
                    size as u64,
                    BufferUsage::TRANSFER_DST,
                    alloc::mapping_properties(),
                )
                .map_err(anyhow::Error::from)?,
            )
        } else {
            None
        };

        let passes = &self.passes;
        let pipelines = &self.pipelines;
        let pipeline_layout = &self.pipeline_layout;
        let composed = Self::one_shot(&context, &mut self.command_pool, |cb| unsafe {
            cb.bind_compute_pipeline(&pipelines.deltas);
            cb.push_compute_constants(pipeline_layout, 0, &[0u32, scalar.to_bits()]);
            for (index, pass_id) in pass_ids.iter().enumerate() {
                let pass = &passes[pass_id];
                cb.bind_compute_descriptor_sets(
                    pipeline_layout,
                    0,
                    [&pass.descriptor_set, &network.descriptor_set].into_iter(),
                    empty(),
                );
                if index > 0 {
                    // Later keys accumulate into the tensor the previous
                    // dispatch just wrote.
                    cb.pipeline_barrier(
                        PipelineStage::COMPUTE_SHADER..PipelineStage::COMPUTE_SHADER,
                        Dependencies::empty(),
                        once(image_barrier::<B>(
                            network.data_image.image(),
                            GENERAL_RW..GENERAL_RW,
                        )),
                    );
                }
                cb.dispatch([
                    work_groups(extent.width, KERNEL_SIZE),
                    work_groups(extent.height, KERNEL_SIZE),
                    work_groups(extent.depth, KERNEL_SIZE),
                ]);
            }
            if let Some(readback) = readback.as_ref() {
                cb.pipeline_barrier(
                    PipelineStage::COMPUTE_SHADER..PipelineStage::TRANSFER,
                    Dependencies::empty(),
                    once(image_barrier::<B>(
                        network.data_image.image(),
                        GENERAL_RW..TRANSFER_SRC,
                    )),
                );
                cb.copy_image_to_buffer(
                    network.data_image.image(),
                    Layout::TransferSrcOptimal,
                    readback.buffer(),
                    once(BufferImageCopy {
                        buffer_offset: 0,
                        buffer_width: extent.width,
                        buffer_height: extent.height,
                        image_layers: color_layers(),
                        image_offset: Offset { x: 0, y: 0, z: 0 },
                        image_extent: extent,
                    }),
                );
                cb.pipeline_barrier(
                    PipelineStage::TRANSFER..PipelineStage::COMPUTE_SHADER,
                    Dependencies::empty(),
                    once(image_barrier::<B>(
                        network.data_image.image(),
                        TRANSFER_SRC..GENERAL_RW,
                    )),
                );
            }
        });
        if let Err(err) = composed {
            if let Some(readback) = readback {
                unsafe { readback.free(device) };
            }
            return Err(err.into());
        }
        if let Some(mut readback) = readback {
            let row = extent.width as usize;
            let slice = row * extent.height as usize;
            let mut bytes = vec![0u8; slice * extent.depth as usize * size_of::<Float>()];
            let read = readback.read(device, &mut bytes);
            unsafe { readback.free(device) };
            read.map_err(anyhow::Error::from)?;
            let values: &[Float] = bytemuck::cast_slice(&bytes);
            for (i, layer) in nn.layers_mut().iter_mut().enumerate() {
                let base = i * slice;
                for c in 0..layer.size {
                    *layer.bias_mut(c) = values[base + c * row];
                    for p in 0..layer.previous_size {
                        *layer.weight_mut(c, p) = values[base + c * row + 1 + p];
                    }
                }
            }
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            let unreferenced: Vec<NetworkId> = self
                .networks
                .iter()
                .filter(|(_, resources)| resources.references == 0)
                .map(|(id, _)| *id)
                .collect();
            for id in unreferenced {
                self.free_network(id);
            }
        }
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

impl<B: Backend> Drop for GpuEvaluator<B> {
    fn drop(&mut self) {
        // Drain in-flight work before touching any shared resource, then
        // force every refcount to zero.
        self.training = false;
        let context = self.context.clone();
        let device = context.device();
        for (_, result) in self.results.drain() {
            unsafe {
                let _ = device.wait_for_fence(&result.fence, u64::MAX);
                device.destroy_fence(result.fence);
                self.command_pool.free(once(result.command_buffer));
                for staging in result.staging {
                    staging.free(device);
                }
            }
        }
        for (_, pass) in self.passes.drain() {
            unsafe {
                pass.activations.free(device);
                pass.z.free(device);
                pass.deltas.free(device);
                self.descriptor_pool.free(once(pass.descriptor_set));
            }
        }
        for (_, network) in self.networks.drain() {
            unsafe {
                network.info_buffer.free(device);
                network.data_image.free(device);
                self.descriptor_pool.free(once(network.descriptor_set));
            }
        }
        unsafe {
            ManuallyDrop::take(&mut self.pipelines).free(device);
            device.destroy_pipeline_layout(ManuallyDrop::take(&mut self.pipeline_layout));
            device.destroy_descriptor_set_layout(ManuallyDrop::take(&mut self.evaluation_layout));
            device.destroy_descriptor_set_layout(ManuallyDrop::take(&mut self.network_layout));
            device.destroy_descriptor_pool(ManuallyDrop::take(&mut self.descriptor_pool));
            device.destroy_command_pool(ManuallyDrop::take(&mut self.command_pool));
        }
    }
}
