//! Dedicated buffer and image allocations.
//!
//! Every resource gets its own memory object. Allocation sizes here are a
//! handful of tensors per pass, so a sub-allocating arena buys nothing; what
//! matters is that every object is destroyed exactly once, with the device
//! that created it.

use crate::error::DeviceError;
use gfx_hal::{
    adapter::MemoryProperties,
    buffer,
    device::Device,
    format::Swizzle,
    image::{self, Extent, Kind, SubresourceRange, Tiling, ViewCapabilities, ViewKind},
    memory::{Properties, Segment, SparseFlags},
    Backend, MemoryTypeId,
};

use super::context::TENSOR_FORMAT;

pub(crate) const COLOR_RANGE: SubresourceRange = SubresourceRange {
    aspects: gfx_hal::format::Aspects::COLOR,
    level_start: 0,
    level_count: None,
    layer_start: 0,
    layer_count: None,
};

fn memory_type_id(
    memory_properties: &MemoryProperties,
    type_mask: u32,
    properties: Properties,
) -> Result<MemoryTypeId, DeviceError> {
    memory_properties
        .memory_types
        .iter()
        .enumerate()
        .position(|(i, memory_type)| {
            type_mask & (1 << i) != 0 && memory_type.properties.contains(properties)
        })
        .map(MemoryTypeId)
        .ok_or(DeviceError::NoCompatibleMemory)
}

pub(crate) fn mapping_properties() -> Properties {
    Properties::CPU_VISIBLE | Properties::COHERENT
}

/// A buffer bound to its own memory.
#[derive(Debug)]
pub(crate) struct DeviceBuffer<B: Backend> {
    buffer: B::Buffer,
    memory: B::Memory,
    size: u64,
}

impl<B: Backend> DeviceBuffer<B> {
    pub(crate) fn new(
        device: &B::Device,
        memory_properties: &MemoryProperties,
        size: u64,
        usage: buffer::Usage,
        properties: Properties,
    ) -> Result<Self, DeviceError> {
        let mut buffer = match unsafe { device.create_buffer(size, usage, SparseFlags::empty()) } {
            Ok(buffer) => buffer,
            Err(err) => return Err(err.into()),
        };
        let requirements = unsafe { device.get_buffer_requirements(&buffer) };
        let type_id = match memory_type_id(memory_properties, requirements.type_mask, properties) {
            Ok(type_id) => type_id,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer) };
                return Err(err);
            }
        };
        let memory = match unsafe { device.allocate_memory(type_id, requirements.size) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer) };
                return Err(err.into());
            }
        };
        if let Err(err) = unsafe { device.bind_buffer_memory(&memory, 0, &mut buffer) } {
            unsafe {
                device.destroy_buffer(buffer);
                device.free_memory(memory);
            }
            return Err(err.into());
        }
        Ok(Self {
            buffer,
            memory,
            size,
        })
    }

    /// A host-visible staging buffer pre-filled with `data`.
    pub(crate) fn staging(
        device: &B::Device,
        memory_properties: &MemoryProperties,
        usage: buffer::Usage,
        data: &[u8],
    ) -> Result<Self, DeviceError> {
        let mut buffer = Self::new(
            device,
            memory_properties,
            data.len() as u64,
            usage,
            mapping_properties(),
        )?;
        if let Err(err) = buffer.write(device, data) {
            unsafe { buffer.free(device) };
            return Err(err);
        }
        Ok(buffer)
    }

    pub(crate) fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }

    /// Copies `data` into the buffer through a transient mapping. The memory
    /// is coherent, so no explicit flush is needed.
    pub(crate) fn write(&mut self, device: &B::Device, data: &[u8]) -> Result<(), DeviceError> {
        debug_assert!(data.len() as u64 <= self.size);
        unsafe {
            let mapping = device.map_memory(
                &mut self.memory,
                Segment {
                    offset: 0,
                    size: None,
                },
            )?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapping, data.len());
            device.unmap_memory(&mut self.memory);
        }
        Ok(())
    }

    /// Reads the buffer contents back out through a transient mapping.
    pub(crate) fn read(&mut self, device: &B::Device, out: &mut [u8]) -> Result<(), DeviceError> {
        debug_assert!(out.len() as u64 <= self.size);
        unsafe {
            let mapping = device.map_memory(
                &mut self.memory,
                Segment {
                    offset: 0,
                    size: None,
                },
            )?;
            std::ptr::copy_nonoverlapping(mapping, out.as_mut_ptr(), out.len());
            device.unmap_memory(&mut self.memory);
        }
        Ok(())
    }

    pub(crate) unsafe fn free(self, device: &B::Device) {
        device.destroy_buffer(self.buffer);
        device.free_memory(self.memory);
    }
}

/// A 3D single-channel float storage image bound to its own memory, with one
/// full view.
#[derive(Debug)]
pub(crate) struct DeviceImage<B: Backend> {
    image: B::Image,
    view: B::ImageView,
    memory: B::Memory,
    extent: Extent,
}

impl<B: Backend> DeviceImage<B> {
    pub(crate) fn new(
        device: &B::Device,
        memory_properties: &MemoryProperties,
        extent: Extent,
        usage: image::Usage,
    ) -> Result<Self, DeviceError> {
        let kind = Kind::D3(extent.width, extent.height, extent.depth);
        let mut image = match unsafe {
            device.create_image(
                kind,
                1,
                TENSOR_FORMAT,
                Tiling::Optimal,
                usage,
                SparseFlags::empty(),
                ViewCapabilities::empty(),
            )
        } {
            Ok(image) => image,
            Err(err) => return Err(err.into()),
        };
        let requirements = unsafe { device.get_image_requirements(&image) };
        let type_id = memory_type_id(
            memory_properties,
            requirements.type_mask,
            Properties::DEVICE_LOCAL,
        )
        .or_else(|_| memory_type_id(memory_properties, requirements.type_mask, Properties::empty()));
        let type_id = match type_id {
            Ok(type_id) => type_id,
            Err(err) => {
                unsafe { device.destroy_image(image) };
                return Err(err);
            }
        };
        let memory = match unsafe { device.allocate_memory(type_id, requirements.size) } {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(image) };
                return Err(err.into());
            }
        };
        if let Err(err) = unsafe { device.bind_image_memory(&memory, 0, &mut image) } {
            unsafe {
                device.destroy_image(image);
                device.free_memory(memory);
            }
            return Err(err.into());
        }
        let view = match unsafe {
            device.create_image_view(
                &image,
                ViewKind::D3,
                TENSOR_FORMAT,
                Swizzle::NO,
                usage,
                COLOR_RANGE,
            )
        } {
            Ok(view) => view,
            Err(err) => {
                unsafe {
                    device.destroy_image(image);
                    device.free_memory(memory);
                }
                return Err(err.into());
            }
        };
        Ok(Self {
            image,
            view,
            memory,
            extent,
        })
    }

    pub(crate) fn image(&self) -> &B::Image {
        &self.image
    }

    pub(crate) fn view(&self) -> &B::ImageView {
        &self.view
    }

    pub(crate) fn extent(&self) -> Extent {
        self.extent
    }

    pub(crate) unsafe fn free(self, device: &B::Device) {
        device.destroy_image_view(self.view);
        device.destroy_image(self.image);
        device.free_memory(self.memory);
    }
}
