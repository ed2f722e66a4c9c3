//! Buffer management for uniforms, storage and readback
//!
//! Memory management following RAII patterns with explicit allocation and cleanup.
//! Host access goes through [`MappedRegion`], a bounded view of the mapped range.

use ash::vk;
use bytemuck::Pod;
use std::ptr::NonNull;

use super::commands::CommandRecorder;
use super::image::{Image, ImageLayout};
use super::memory::{align_size, min_offset_alignment};
use super::{VulkanContext, VulkanError, VulkanResult};

/// Buffer wrapper with memory management
///
/// Uniform and storage buffers are sized up to the device's minimum offset
/// alignment for their usage class. A mapped buffer is unmapped on drop.
pub struct Buffer<'ctx> {
    context: &'ctx VulkanContext,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    requested_size: vk::DeviceSize,
    size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

impl<'ctx> Buffer<'ctx> {
    /// Create a new buffer with memory allocation
    pub fn new(
        context: &'ctx VulkanContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        if size == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "buffer size must be non-zero".to_string(),
            });
        }

        let aligned_size = align_size(size, min_offset_alignment(context.limits(), usage));
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(aligned_size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let device = context.device();
        let mut buffer = Self {
            context,
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            requested_size: size,
            size: aligned_size,
            mapped: None,
        };

        buffer.buffer =
            unsafe { device.create_buffer(&buffer_info, None) }.map_err(VulkanError::Api)?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer.buffer) };
        buffer.memory = context.allocate_memory(requirements, properties)?;

        unsafe { device.bind_buffer_memory(buffer.buffer, buffer.memory, 0) }
            .map_err(VulkanError::Api)?;

        Ok(buffer)
    }

    /// Host-visible, coherent transfer source holding a copy of `data`
    pub fn staging_with_data(context: &'ctx VulkanContext, data: &[u8]) -> VulkanResult<Self> {
        let mut staging = Self::new(
            context,
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.map()?.write_bytes(0, data)?;
        staging.unmap();
        Ok(staging)
    }

    /// Get the buffer handle
    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size of the buffer object after alignment
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Size the caller asked for
    pub const fn requested_size(&self) -> vk::DeviceSize {
        self.requested_size
    }

    /// Map the buffer and return a bounded view of it
    ///
    /// The mapping persists until [`Buffer::unmap`] or drop; mapping an already
    /// mapped buffer reuses the existing pointer.
    pub fn map(&mut self) -> VulkanResult<MappedRegion<'_>> {
        let ptr = match self.mapped {
            Some(ptr) => ptr,
            None => {
                let raw = unsafe {
                    self.context.device().map_memory(
                        self.memory,
                        0,
                        vk::WHOLE_SIZE,
                        vk::MemoryMapFlags::empty(),
                    )
                }
                .map_err(VulkanError::Api)?;
                let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| VulkanError::InvalidOperation {
                    reason: "driver returned a null mapping".to_string(),
                })?;
                self.mapped = Some(ptr);
                ptr
            }
        };

        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) };
        Ok(MappedRegion::new(bytes))
    }

    /// Unmap the buffer; no-op when not mapped
    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.context.device().unmap_memory(self.memory) };
        }
    }

    /// Copy this buffer's contents into `dst` through a one-shot command
    pub fn copy_to(&self, dst: &Buffer<'_>) -> VulkanResult<()> {
        if dst.size < self.requested_size {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "copy of {} bytes into a {} byte buffer",
                    self.requested_size, dst.size
                ),
            });
        }
        self.context.execute_single_time(|recorder| {
            recorder.copy_buffer(self.buffer, dst.buffer, self.requested_size);
            Ok(())
        })
    }

    /// Record a copy of this buffer's leading bytes into `image`
    ///
    /// The image must be in `TransferDst`.
    pub fn record_copy_to_image(&self, recorder: &CommandRecorder<'_>, image: &Image<'_>) -> VulkanResult<()> {
        if image.layout() != ImageLayout::TransferDst {
            return Err(VulkanError::InvalidOperation {
                reason: format!("buffer copy requires TransferDst, image is {:?}", image.layout()),
            });
        }
        if self.size < image.byte_size() {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "buffer of {} bytes cannot fill a {} byte image",
                    self.size,
                    image.byte_size()
                ),
            });
        }

        recorder.copy_buffer_to_image(self.buffer, image.handle(), image.width(), image.height());
        Ok(())
    }

    /// Copy this buffer into `image` through a one-shot command
    pub fn copy_to_image(&self, image: &Image<'_>) -> VulkanResult<()> {
        self.context
            .execute_single_time(|recorder| self.record_copy_to_image(recorder, image))
    }

    /// Fill this buffer with `data` through a temporary staging buffer
    ///
    /// The only route into device-local memory. The staging buffer is
    /// released before returning.
    pub fn create_staging_and_upload(&self, data: &[u8]) -> VulkanResult<()> {
        if data.len() as vk::DeviceSize > self.size {
            return Err(VulkanError::RegionOutOfBounds {
                offset: 0,
                len: data.len(),
                capacity: self.size as usize,
            });
        }
        let staging = Self::staging_with_data(self.context, data)?;
        staging.copy_to(self)
    }

    /// Descriptor info covering the requested bytes
    ///
    /// Alignment padding is left out of the range so runtime-sized arrays in
    /// the kernel see exactly the records that were written.
    pub const fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range: self.requested_size,
        }
    }
}

impl Drop for Buffer<'_> {
    fn drop(&mut self) {
        self.unmap();
        let device = self.context.device();
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Bounded read/write view of a mapped buffer
///
/// Every access is range-checked and fails with
/// [`VulkanError::RegionOutOfBounds`] rather than touching memory past the end.
pub struct MappedRegion<'a> {
    bytes: &'a mut [u8],
}

impl<'a> MappedRegion<'a> {
    pub(crate) fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Length of the region in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn range(&self, offset: usize, len: usize) -> VulkanResult<std::ops::Range<usize>> {
        let end = offset.checked_add(len).filter(|end| *end <= self.bytes.len());
        end.map(|end| offset..end).ok_or(VulkanError::RegionOutOfBounds {
            offset,
            len,
            capacity: self.bytes.len(),
        })
    }

    /// Copy `data` into the region at `offset`
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> VulkanResult<()> {
        let range = self.range(offset, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Write a plain-old-data value at `offset`
    pub fn write<T: Pod>(&mut self, offset: usize, value: &T) -> VulkanResult<()> {
        self.write_bytes(offset, bytemuck::bytes_of(value))
    }

    /// Write a slice of plain-old-data values starting at `offset`
    pub fn write_slice<T: Pod>(&mut self, offset: usize, values: &[T]) -> VulkanResult<()> {
        self.write_bytes(offset, bytemuck::cast_slice(values))
    }

    /// Fill `destination` from the region starting at `offset`
    pub fn read_into(&self, offset: usize, destination: &mut [u8]) -> VulkanResult<()> {
        let range = self.range(offset, destination.len())?;
        destination.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    /// Whole region as a byte slice
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }
}
