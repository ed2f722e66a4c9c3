//! Command buffer management
//!
//! [`CommandRecorder`] wraps a command buffer in the recording state and
//! exposes the handful of commands the ray tracer issues. [`CommandStream`]
//! pairs a reusable command buffer with the fence that guards it.

use ash::{vk, Device};
use std::cell::Cell;

use super::image::LayoutTransition;
use super::sync::Fence;
use super::{VulkanContext, VulkanError, VulkanResult};

/// Single-mip, single-layer color subresource
pub(crate) const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

const COLOR_SUBRESOURCE_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// Tightly packed whole-image copy region
fn full_image_copy(width: u32, height: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(COLOR_SUBRESOURCE_LAYERS)
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .build()
}

/// Records commands into a command buffer that is already recording
pub struct CommandRecorder<'a> {
    device: &'a Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> CommandRecorder<'a> {
    /// Wrap a command buffer in the recording state
    pub const fn new(device: &'a Device, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            command_buffer,
        }
    }

    /// Get the command buffer handle
    pub const fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Record an image memory barrier for a layout transition
    pub fn image_barrier(&self, image: vk::Image, transition: &LayoutTransition) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(transition.from.vk_layout())
            .new_layout(transition.to.vk_layout())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_SUBRESOURCE_RANGE)
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    /// Order shader writes from earlier dispatches before this one's reads and writes
    pub fn compute_memory_barrier(&self) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    /// Bind a compute pipeline
    pub fn bind_compute_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::COMPUTE, pipeline);
        }
    }

    /// Bind a descriptor set at set index 0 of a compute layout
    pub fn bind_descriptor_set(&self, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[set],
                &[],
            );
        }
    }

    /// Dispatch compute work groups
    pub fn dispatch(&self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        unsafe {
            self.device
                .cmd_dispatch(self.command_buffer, group_count_x, group_count_y, group_count_z);
        }
    }

    /// Copy `size` bytes from the start of `src` to the start of `dst`
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(self.command_buffer, src, dst, &[region]);
        }
    }

    /// Copy a tightly packed buffer into an image in `TRANSFER_DST_OPTIMAL`
    pub fn copy_buffer_to_image(&self, buffer: vk::Buffer, image: vk::Image, width: u32, height: u32) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[full_image_copy(width, height)],
            );
        }
    }

    /// Copy an image in `TRANSFER_SRC_OPTIMAL` into a tightly packed buffer
    pub fn copy_image_to_buffer(&self, image: vk::Image, buffer: vk::Buffer, width: u32, height: u32) {
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.command_buffer,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                buffer,
                &[full_image_copy(width, height)],
            );
        }
    }

    /// Clear an image in `TRANSFER_DST_OPTIMAL` to a constant color
    pub fn clear_color_image(&self, image: vk::Image, color: [f32; 4]) {
        let clear_value = vk::ClearColorValue { float32: color };
        unsafe {
            self.device.cmd_clear_color_image(
                self.command_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_value,
                &[COLOR_SUBRESOURCE_RANGE],
            );
        }
    }
}

/// Whether a stream's fence will ever signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    /// Signaled, or guarding a submission that will signal it
    Armed,
    /// Reset for a submission the queue rejected; nothing will signal it
    Orphaned,
}

impl FenceState {
    const fn after_submit(accepted: bool) -> Self {
        if accepted {
            Self::Armed
        } else {
            Self::Orphaned
        }
    }

    const fn needs_wait(self) -> bool {
        matches!(self, Self::Armed)
    }
}

/// A reusable command buffer guarded by its own fence
///
/// Each stream is re-recorded every frame. The fence is waited on before the
/// buffer is touched and reset immediately before resubmission, so a stream
/// never records over work the GPU is still executing. A rejected submission
/// leaves the fence unsignaled with no work pending; later waits skip it.
pub struct CommandStream<'ctx> {
    context: &'ctx VulkanContext,
    command_buffer: vk::CommandBuffer,
    fence: Fence,
    fence_state: Cell<FenceState>,
    name: &'static str,
}

impl<'ctx> CommandStream<'ctx> {
    /// Allocate the command buffer and a signaled fence
    pub fn new(context: &'ctx VulkanContext, name: &'static str) -> VulkanResult<Self> {
        let fence = Fence::new(context.device().clone(), true)?;
        let command_buffer = context.allocate_command_buffer()?;

        Ok(Self {
            context,
            command_buffer,
            fence,
            fence_state: Cell::new(FenceState::Armed),
            name,
        })
    }

    /// Block until the previous submission of this stream has finished
    ///
    /// Returns at once when the last submission was rejected.
    pub fn wait(&self) -> VulkanResult<()> {
        if !self.fence_state.get().needs_wait() {
            return Ok(());
        }
        self.fence.wait(u64::MAX)
    }

    /// Wait for prior work, then reset the command buffer and begin recording
    pub fn begin(&self) -> VulkanResult<CommandRecorder<'_>> {
        self.wait()?;

        let device = self.context.device();
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::Api)?;
            device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        Ok(CommandRecorder::new(device, self.command_buffer))
    }

    /// End recording and submit, signalling this stream's fence on completion
    pub fn submit(&self) -> VulkanResult<()> {
        unsafe {
            self.context
                .device()
                .end_command_buffer(self.command_buffer)
                .map_err(VulkanError::Api)?;
        }
        self.fence.reset()?;
        let result = self.context.submit(self.command_buffer, self.fence.handle());
        self.fence_state.set(FenceState::after_submit(result.is_ok()));
        if let Err(e) = result {
            log::warn!("{} stream submission rejected: {}", self.name, e);
            return Err(e);
        }
        log::trace!("Submitted {} stream", self.name);
        Ok(())
    }
}

impl Drop for CommandStream<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            log::error!("Failed waiting on {} stream before release: {}", self.name, e);
        }
        self.context.free_command_buffer(self.command_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_submit_orphans_fence() {
        let state = FenceState::after_submit(false);
        assert_eq!(state, FenceState::Orphaned);
        assert!(!state.needs_wait());
    }

    #[test]
    fn test_accepted_submit_rearms_fence() {
        assert!(FenceState::Armed.needs_wait());
        let recovered = FenceState::after_submit(true);
        assert_eq!(recovered, FenceState::Armed);
        assert!(recovered.needs_wait());
    }

    #[test]
    fn test_whole_image_copy_region() {
        let region = full_image_copy(40, 30);
        assert_eq!(region.buffer_row_length, 0);
        assert_eq!(region.image_extent.width, 40);
        assert_eq!(region.image_extent.height, 30);
        assert_eq!(region.image_extent.depth, 1);
        assert_eq!(region.image_subresource.layer_count, 1);
    }
}
