//! Device images and their layout state machine
//!
//! Every [`Image`] carries the layout tag the GPU will see once the commands
//! recorded so far have executed. Transitions are looked up in a closed table;
//! a pair outside it is rejected with
//! [`VulkanError::UnsupportedLayoutTransition`] before anything is recorded.
//!
//! ```text
//! Undefined ──► TransferDst ──► General ◄──► TransferSrc
//!     └───────► TransferSrc ──────┘
//! ```

use ash::vk;

use super::buffer::Buffer;
use super::commands::{CommandRecorder, COLOR_SUBRESOURCE_RANGE};
use super::{VulkanContext, VulkanError, VulkanResult};

/// Layout tag of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents undefined; only valid as a source
    Undefined,
    /// Read/write from compute shaders
    General,
    /// Source of a transfer
    TransferSrc,
    /// Destination of a transfer or clear
    TransferDst,
}

impl ImageLayout {
    /// Matching Vulkan layout
    pub const fn vk_layout(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::General => vk::ImageLayout::GENERAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        }
    }

    /// Access and stage that must complete before leaving this layout
    const fn source_scope(self) -> (vk::AccessFlags, vk::PipelineStageFlags) {
        match self {
            Self::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
            Self::General => (
                vk::AccessFlags::from_raw(
                    vk::AccessFlags::SHADER_READ.as_raw() | vk::AccessFlags::SHADER_WRITE.as_raw(),
                ),
                vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
            Self::TransferSrc => (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER),
            Self::TransferDst => (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER),
        }
    }

    /// Access and stage that wait on entering this layout
    const fn destination_scope(self) -> (vk::AccessFlags, vk::PipelineStageFlags) {
        match self {
            Self::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE),
            other => other.source_scope(),
        }
    }
}

/// Barrier parameters for one supported transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    /// Layout before the barrier
    pub from: ImageLayout,
    /// Layout after the barrier
    pub to: ImageLayout,
    /// Accesses made available before the transition
    pub src_access: vk::AccessFlags,
    /// Accesses that wait for the transition
    pub dst_access: vk::AccessFlags,
    /// Stage that produced the prior accesses
    pub src_stage: vk::PipelineStageFlags,
    /// Stage that consumes the image afterwards
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// Look up `from -> to` in the transition table
    pub fn between(from: ImageLayout, to: ImageLayout) -> VulkanResult<Self> {
        use ImageLayout::{General, TransferDst, TransferSrc, Undefined};

        let supported = match (from, to) {
            (Undefined, TransferDst | TransferSrc)
            | (TransferDst | TransferSrc, General)
            | (General, TransferSrc) => true,
            (Undefined | General | TransferSrc | TransferDst, _) => false,
        };
        if !supported {
            return Err(VulkanError::UnsupportedLayoutTransition { from, to });
        }

        let (src_access, src_stage) = from.source_scope();
        let (dst_access, dst_stage) = to.destination_scope();
        Ok(Self {
            from,
            to,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        })
    }
}

/// Size in bytes of one texel for the formats the renderer allocates
pub const fn texel_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R8G8B8A8_UNORM | vk::Format::B8G8R8A8_UNORM => Some(4),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// 2D device-local image with its memory and view
pub struct Image<'ctx> {
    context: &'ctx VulkanContext,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    width: u32,
    height: u32,
    format: vk::Format,
    layout: ImageLayout,
}

impl<'ctx> Image<'ctx> {
    /// Create an image in the `Undefined` layout
    pub fn new(
        context: &'ctx VulkanContext,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> VulkanResult<Self> {
        if width == 0 || height == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: format!("cannot create a {width}x{height} image"),
            });
        }
        if texel_size(format).is_none() {
            return Err(VulkanError::UnsupportedFormat(format));
        }

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let device = context.device();

        // Null handles are released as no-ops if a later step fails.
        let mut image = Self {
            context,
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            width,
            height,
            format,
            layout: ImageLayout::Undefined,
        };

        image.image = unsafe { device.create_image(&image_info, None) }.map_err(VulkanError::Api)?;

        let requirements = unsafe { device.get_image_memory_requirements(image.image) };
        image.memory =
            context.allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        unsafe { device.bind_image_memory(image.image, image.memory, 0) }
            .map_err(VulkanError::Api)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(COLOR_SUBRESOURCE_RANGE);
        image.view =
            unsafe { device.create_image_view(&view_info, None) }.map_err(VulkanError::Api)?;

        Ok(image)
    }

    /// Get the image handle
    pub const fn handle(&self) -> vk::Image {
        self.image
    }

    /// Get the image view handle
    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Width in pixels
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    /// Current layout tag
    pub const fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Bytes needed to hold the whole image tightly packed
    pub fn byte_size(&self) -> vk::DeviceSize {
        let texel = texel_size(self.format).unwrap_or(0);
        vk::DeviceSize::from(self.width) * vk::DeviceSize::from(self.height) * vk::DeviceSize::from(texel)
    }

    /// Record a transition into `recorder` and update the layout tag
    pub fn record_transition(&mut self, recorder: &CommandRecorder<'_>, to: ImageLayout) -> VulkanResult<()> {
        let transition = LayoutTransition::between(self.layout, to)?;
        recorder.image_barrier(self.image, &transition);
        self.layout = to;
        Ok(())
    }

    /// Record into a one-shot command buffer, submit and wait
    ///
    /// The layout tag is only kept when the work completed; on any failure it
    /// reverts to the layout the image had on entry.
    pub(crate) fn execute_tracked<F>(&mut self, record: F) -> VulkanResult<()>
    where
        F: FnOnce(&mut Self, &CommandRecorder<'_>) -> VulkanResult<()>,
    {
        let previous = self.layout;
        let context = self.context;
        let result = context.execute_single_time(|recorder| record(self, recorder));
        restore_layout_on_error(&mut self.layout, previous, result)
    }

    /// Transition through a one-shot command buffer and wait for it
    pub fn transition_layout_immediate(&mut self, to: ImageLayout) -> VulkanResult<()> {
        self.execute_tracked(|image, recorder| image.record_transition(recorder, to))
    }

    /// Record a copy of the whole image into `buffer`
    ///
    /// The image must already be in `TransferSrc`.
    pub fn copy_to_buffer(&self, recorder: &CommandRecorder<'_>, buffer: &Buffer<'_>) -> VulkanResult<()> {
        if self.layout != ImageLayout::TransferSrc {
            return Err(VulkanError::InvalidOperation {
                reason: format!("image copy requires TransferSrc, image is {:?}", self.layout),
            });
        }
        if buffer.size() < self.byte_size() {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "buffer of {} bytes cannot hold a {} byte image",
                    buffer.size(),
                    self.byte_size()
                ),
            });
        }

        recorder.copy_image_to_buffer(self.image, buffer.handle(), self.width, self.height);
        Ok(())
    }

    /// Record transition to `TransferSrc`, the copy, and the transition back
    ///
    /// Both transitions are checked before anything is recorded.
    pub fn transition_and_copy_to_buffer(
        &mut self,
        recorder: &CommandRecorder<'_>,
        buffer: &Buffer<'_>,
    ) -> VulkanResult<()> {
        let original = self.layout;
        if original == ImageLayout::TransferSrc {
            return self.copy_to_buffer(recorder, buffer);
        }

        LayoutTransition::between(original, ImageLayout::TransferSrc)?;
        LayoutTransition::between(ImageLayout::TransferSrc, original)?;

        self.record_transition(recorder, ImageLayout::TransferSrc)?;
        self.copy_to_buffer(recorder, buffer)?;
        self.record_transition(recorder, original)
    }

    /// Record `Undefined -> TransferDst`, a clear, and `TransferDst -> General`
    ///
    /// Discards whatever the image held before.
    pub fn record_clear_to_general(&mut self, recorder: &CommandRecorder<'_>, color: [f32; 4]) -> VulkanResult<()> {
        self.record_transition(recorder, ImageLayout::TransferDst)?;
        recorder.clear_color_image(self.image, color);
        self.record_transition(recorder, ImageLayout::General)
    }

    /// Read the whole image back to host memory
    ///
    /// Goes through a temporary host-visible buffer and restores the image's
    /// layout afterwards.
    pub fn copy_to_host(&mut self) -> VulkanResult<Vec<u8>> {
        let context = self.context;
        let mut readback = Buffer::new(
            context,
            self.byte_size(),
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        self.execute_tracked(|image, recorder| image.transition_and_copy_to_buffer(recorder, &readback))?;

        let mut pixels = vec![0u8; readback.size() as usize];
        readback.map()?.read_into(0, &mut pixels)?;
        readback.unmap();
        Ok(pixels)
    }

    /// Fill a fresh image with `data` and leave it in `General`
    ///
    /// `data` must be exactly [`Image::byte_size`] bytes.
    pub fn upload(&mut self, data: &[u8]) -> VulkanResult<()> {
        if data.len() as vk::DeviceSize != self.byte_size() {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "upload of {} bytes into a {} byte image",
                    data.len(),
                    self.byte_size()
                ),
            });
        }

        let staging = Buffer::staging_with_data(self.context, data)?;
        self.execute_tracked(|image, recorder| {
            image.record_transition(recorder, ImageLayout::TransferDst)?;
            staging.record_copy_to_image(recorder, image)?;
            image.record_transition(recorder, ImageLayout::General)
        })
    }

    /// Descriptor info binding this image as a storage image
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: self.view,
            image_layout: vk::ImageLayout::GENERAL,
        }
    }
}

impl Drop for Image<'_> {
    fn drop(&mut self) {
        let device = self.context.device();
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Put `layout` back to `previous` when the recorded work never ran
fn restore_layout_on_error<T>(
    layout: &mut ImageLayout,
    previous: ImageLayout,
    result: VulkanResult<T>,
) -> VulkanResult<T> {
    if result.is_err() {
        *layout = previous;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ImageLayout::{General, TransferDst, TransferSrc, Undefined};

    const ALL: [ImageLayout; 4] = [Undefined, General, TransferSrc, TransferDst];

    #[test]
    fn test_supported_transitions() {
        let supported = [
            (Undefined, TransferDst),
            (Undefined, TransferSrc),
            (TransferDst, General),
            (TransferSrc, General),
            (General, TransferSrc),
        ];

        for from in ALL {
            for to in ALL {
                let result = LayoutTransition::between(from, to);
                if supported.contains(&(from, to)) {
                    assert!(result.is_ok(), "{from:?} -> {to:?} should be supported");
                } else {
                    assert!(
                        matches!(
                            result,
                            Err(VulkanError::UnsupportedLayoutTransition { from: f, to: t })
                                if f == from && t == to
                        ),
                        "{from:?} -> {to:?} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn test_undefined_cannot_go_straight_to_general() {
        assert!(LayoutTransition::between(Undefined, General).is_err());
    }

    #[test]
    fn test_compute_to_transfer_masks() {
        let transition = LayoutTransition::between(General, TransferSrc).unwrap();
        assert_eq!(
            transition.src_access,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(transition.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(transition.dst_access, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(transition.dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn test_transfer_back_to_compute_masks() {
        let transition = LayoutTransition::between(TransferSrc, General).unwrap();
        assert_eq!(transition.src_access, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(transition.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(
            transition.dst_access,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(transition.dst_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    #[test]
    fn test_initial_transition_waits_on_nothing() {
        let transition = LayoutTransition::between(Undefined, TransferDst).unwrap();
        assert!(transition.src_access.is_empty());
        assert_eq!(transition.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(transition.dst_access, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn test_layout_tags_map_to_vulkan() {
        assert_eq!(General.vk_layout(), vk::ImageLayout::GENERAL);
        assert_eq!(TransferSrc.vk_layout(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(TransferDst.vk_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(Undefined.vk_layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_failed_work_restores_layout_tag() {
        let mut layout = TransferDst;
        let failed: VulkanResult<()> = Err(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST));
        assert!(restore_layout_on_error(&mut layout, Undefined, failed).is_err());
        assert_eq!(layout, Undefined);
    }

    #[test]
    fn test_completed_work_keeps_layout_tag() {
        let mut layout = General;
        assert!(restore_layout_on_error(&mut layout, Undefined, Ok(())).is_ok());
        assert_eq!(layout, General);
    }

    #[test]
    fn test_texel_sizes() {
        assert_eq!(texel_size(vk::Format::B8G8R8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::D32_SFLOAT), None);
    }
}
