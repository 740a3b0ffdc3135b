//! Device discovery and the shared context.
//!
//! A [`Context`] owns the instance, adapter, logical device, and the
//! compute+transfer queue. The evaluator holds it behind an [`Arc`], so a
//! collaborator (such as a debug viewer) can construct the context itself,
//! hand it over, and keep using the device; whoever drops the last reference
//! releases it. The evaluator therefore never tears down objects it did not
//! create.

use crate::{error::DeviceError, Float, Result};
use gfx_hal::{
    adapter::{Adapter, DeviceType, MemoryProperties, PhysicalDevice},
    format::{Format, ImageFeature},
    image,
    queue::{QueueFamily, QueueFamilyId},
    Backend, Features, Instance, Limits,
};
use parking_lot::{Mutex, MutexGuard};
use std::mem::size_of;

/// The single texel format the engine stores tensors in.
pub(crate) const TENSOR_FORMAT: Format = Format::R32Sfloat;

const _: () = assert!(size_of::<Float>() == 4, "tensor format is 32-bit");

/// Score of one adapter, or `None` when it cannot run the engine at all.
///
/// Favors large images and deep dispatch limits, with a flat bonus for
/// discrete hardware.
fn score_adapter<B: Backend>(adapter: &Adapter<B>) -> Option<(u64, QueueFamilyId)> {
    let family = adapter.queue_families.iter().find(|family| {
        family.queue_type().supports_compute() && family.queue_type().supports_transfer()
    })?;
    let format_properties = adapter
        .physical_device
        .format_properties(Some(TENSOR_FORMAT));
    if !format_properties.optimal_tiling.contains(ImageFeature::STORAGE) {
        return None;
    }
    let limits = adapter.physical_device.properties().limits;
    let mut score = limits.max_image_2d_size as u64;
    for count in limits.max_compute_work_group_count {
        score += count as u64;
    }
    if adapter.info.device_type == DeviceType::DiscreteGpu {
        score += 10_000;
    }
    Some((score, family.id()))
}

/// Everything the evaluator shares with collaborators: instance, adapter,
/// logical device, and the compute queue.
pub struct Context<B: Backend> {
    // Dropped in declaration order: queue and device before the instance.
    queue: Mutex<B::Queue>,
    device: B::Device,
    adapter: Adapter<B>,
    instance: Option<B::Instance>,
    compute_family: QueueFamilyId,
    memory_properties: MemoryProperties,
    limits: Limits,
    extra_image_usage: image::Usage,
}

impl<B: Backend> Context<B> {
    /// Creates an instance, scores every adapter, and opens the best one with
    /// one queue on its compute+transfer family plus one on each family in
    /// `shared_families` (for collaborators that present or transfer on their
    /// own queues).
    pub fn create(
        name: &str,
        shared_families: &[QueueFamilyId],
        extra_image_usage: image::Usage,
    ) -> Result<Self> {
        let instance =
            B::Instance::create(name, 1).map_err(|_| DeviceError::NoSuitableDevice)?;
        let mut best: Option<(u64, QueueFamilyId, Adapter<B>)> = None;
        for adapter in instance.enumerate_adapters() {
            match score_adapter(&adapter) {
                Some((score, family)) => {
                    log::debug!("compute device \"{}\" score: {}", adapter.info.name, score);
                    if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                        best = Some((score, family, adapter));
                    }
                }
                None => {
                    log::debug!("compute device \"{}\" not suitable", adapter.info.name);
                }
            }
        }
        let (_, compute_family, adapter) = best.ok_or(DeviceError::NoSuitableDevice)?;
        log::info!("compute device selected: {}", adapter.info.name);
        Self::open(instance, adapter, compute_family, shared_families, extra_image_usage)
    }

    fn open(
        instance: B::Instance,
        adapter: Adapter<B>,
        compute_family: QueueFamilyId,
        shared_families: &[QueueFamilyId],
        extra_image_usage: image::Usage,
    ) -> Result<Self> {
        let mut family_ids = vec![compute_family];
        for id in shared_families {
            if !family_ids.contains(id) {
                family_ids.push(*id);
            }
        }
        let families: Vec<(&B::QueueFamily, &[f32])> = adapter
            .queue_families
            .iter()
            .filter(|family| family_ids.contains(&family.id()))
            .map(|family| (family, &[1.0f32] as &[f32]))
            .collect();
        if families.len() != family_ids.len() {
            return Err(DeviceError::NoSuitableDevice.into());
        }
        let mut gpu = unsafe {
            adapter
                .physical_device
                .open(&families, Features::empty())
                .map_err(DeviceError::from)?
        };
        let group = gpu
            .queue_groups
            .iter_mut()
            .find(|group| group.family == compute_family)
            .ok_or(DeviceError::InitializationFailed)?;
        let queue = if group.queues.is_empty() {
            return Err(DeviceError::InitializationFailed.into());
        } else {
            group.queues.remove(0)
        };
        let memory_properties = adapter.physical_device.memory_properties();
        let limits = adapter.physical_device.properties().limits;
        Ok(Self {
            queue: Mutex::new(queue),
            device: gpu.device,
            adapter,
            instance: Some(instance),
            compute_family,
            memory_properties,
            limits,
            extra_image_usage,
        })
    }

    /// Wraps an externally created device. The caller keeps whatever else it
    /// built on the instance alive; this context only borrows the queue it is
    /// given and shares destruction through the [`Arc`] it ends up in.
    pub fn from_parts(
        instance: Option<B::Instance>,
        adapter: Adapter<B>,
        device: B::Device,
        queue: B::Queue,
        compute_family: QueueFamilyId,
        extra_image_usage: image::Usage,
    ) -> Self {
        let memory_properties = adapter.physical_device.memory_properties();
        let limits = adapter.physical_device.properties().limits;
        Self {
            queue: Mutex::new(queue),
            device,
            adapter,
            instance,
            compute_family,
            memory_properties,
            limits,
            extra_image_usage,
        }
    }

    pub(crate) fn device(&self) -> &B::Device {
        &self.device
    }

    pub(crate) fn queue(&self) -> MutexGuard<'_, B::Queue> {
        self.queue.lock()
    }

    pub(crate) fn compute_family(&self) -> QueueFamilyId {
        self.compute_family
    }

    pub(crate) fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    pub(crate) fn extra_image_usage(&self) -> image::Usage {
        self.extra_image_usage
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter.info.name
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Whether the instance is owned by this context (false when a
    /// collaborator created the device and kept the instance).
    pub fn owns_instance(&self) -> bool {
        self.instance.is_some()
    }
}

impl<B: Backend> std::fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("adapter", &self.adapter.info.name)
            .field("compute_family", &self.compute_family)
            .finish()
    }
}
