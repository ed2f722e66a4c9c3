//! # Progressive Renderer
//!
//! Per-frame state machine over the ray-tracing pipeline. Each call to
//! [`Renderer::render`] adds one sample per pixel to the accumulation image;
//! [`Renderer::prepare_image`] and [`Renderer::copy_out`] deliver the result of
//! the previous dispatch to the host.
//!
//! ## Lifecycle
//!
//! ```text
//! new -> (Uninitialized) -> reset/resize -> (Ready) -> render* -> reset/resize -> ... -> drop
//! ```
//!
//! Compute dispatch and image readback each own a command buffer and fence,
//! so the dispatch for frame N can be recorded while the copy of frame N-1
//! is still settling.

use ash::vk;
use std::time::Instant;

use super::camera::CameraMatrices;
use super::pipeline::{bindings, RaytracingPipeline};
use super::scene_parameters::SceneParameters;
use super::vulkan::{
    Buffer, CommandStream, DescriptorResource, Image, ImageLayout, VulkanContext, VulkanError, VulkanResult,
};
use crate::core::config::{OutputFormat, RendererConfig};
use crate::scene::geometry::GeometryBuffers;

/// Kernel work group edge, matching `local_size_x/y` in the kernel
pub const WORKGROUP_SIZE: u32 = 16;

/// Float format of the accumulation image
pub const ACCUMULATION_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Resource-free session state
///
/// Tracks the viewport, the frame counter and the readiness gate. Kept apart
/// from the GPU objects so the transitions can be checked without a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSession {
    width: u32,
    height: u32,
    frame_index: u32,
    ready: bool,
}

impl Default for RenderSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderSession {
    /// Uninitialized session with an empty viewport
    pub const fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            frame_index: 1,
            ready: false,
        }
    }

    /// Store a new viewport size; takes effect on the next reset
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Current viewport size
    pub const fn viewport(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether either viewport dimension is zero
    pub const fn viewport_is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Close the readiness gate while resources are rebuilt
    pub fn begin_reset(&mut self) {
        self.ready = false;
    }

    /// Restart accumulation and open the readiness gate
    pub fn finish_reset(&mut self) {
        self.frame_index = 1;
        self.ready = true;
    }

    /// Whether render calls do anything
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    /// Index of the next frame to render, starting at 1
    pub const fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Whether at least one frame has been dispatched since the last reset
    pub const fn has_rendered(&self) -> bool {
        self.frame_index > 1
    }

    /// Count one successful dispatch
    pub fn advance(&mut self) {
        self.frame_index = self.frame_index.saturating_add(1);
    }

    /// Work groups covering the viewport
    pub const fn work_groups(&self) -> (u32, u32) {
        (
            self.width.div_ceil(WORKGROUP_SIZE),
            self.height.div_ceil(WORKGROUP_SIZE),
        )
    }

    /// Bytes in one tightly packed output frame
    pub const fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Size of the readback buffer for the current viewport
    pub const fn readback_size(&self) -> vk::DeviceSize {
        self.frame_bytes() as vk::DeviceSize
    }
}

/// Check that freshly built targets can be bound as storage images
fn check_bindable(output: ImageLayout, accumulation: ImageLayout) -> VulkanResult<()> {
    for (name, layout) in [("output", output), ("accumulation", accumulation)] {
        if layout != ImageLayout::General {
            return Err(VulkanError::InvalidOperation {
                reason: format!("{name} image is {layout:?}, storage binding needs General"),
            });
        }
    }
    Ok(())
}

/// Resolution-dependent resources, rebuilt on every reset
struct RenderTargets<'ctx> {
    output: Image<'ctx>,
    accumulation: Image<'ctx>,
    readback: Buffer<'ctx>,
}

impl<'ctx> RenderTargets<'ctx> {
    /// Create both images cleared to zero in `General`, plus a mapped readback buffer
    fn new(context: &'ctx VulkanContext, session: &RenderSession, format: OutputFormat) -> VulkanResult<Self> {
        let (width, height) = session.viewport();
        let mut output = Image::new(
            context,
            width,
            height,
            format.vk_format(),
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let mut accumulation = Image::new(
            context,
            width,
            height,
            ACCUMULATION_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
        )?;

        context.execute_single_time(|recorder| {
            output.record_clear_to_general(recorder, [0.0; 4])?;
            accumulation.record_clear_to_general(recorder, [0.0; 4])
        })?;

        check_bindable(output.layout(), accumulation.layout())?;

        let mut readback = readback_buffer(context, session.readback_size())?;
        readback.map()?;

        log::debug!("Created {}x{} render targets ({:?})", width, height, format);
        Ok(Self {
            output,
            accumulation,
            readback,
        })
    }
}

/// Host-visible transfer destination, cached when the device offers it
fn readback_buffer(context: &VulkanContext, size: vk::DeviceSize) -> VulkanResult<Buffer<'_>> {
    let usage = vk::BufferUsageFlags::TRANSFER_DST;
    let coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

    match Buffer::new(context, size, usage, coherent | vk::MemoryPropertyFlags::HOST_CACHED) {
        Err(VulkanError::NoSuitableMemoryType { .. }) => Buffer::new(context, size, usage, coherent),
        other => other,
    }
}

/// Progressive ray-tracing renderer
///
/// Borrows the context it was built from. Fields drop in declaration order
/// after the device has gone idle: command streams, per-resolution targets,
/// the uniform buffer, geometry, and finally the pipeline with its descriptor
/// pool and layouts.
pub struct Renderer<'ctx> {
    context: &'ctx VulkanContext,
    compute_stream: CommandStream<'ctx>,
    copy_stream: CommandStream<'ctx>,
    targets: Option<RenderTargets<'ctx>>,
    uniform_buffer: Buffer<'ctx>,
    geometry: GeometryBuffers<'ctx>,
    pipeline: RaytracingPipeline,
    session: RenderSession,
    output_format: OutputFormat,
    started: Instant,
}

impl<'ctx> Renderer<'ctx> {
    /// Build the pipeline and bind the resolution-independent resources
    ///
    /// The viewport from `config` is stored but no targets exist until the
    /// first [`Renderer::reset`] or [`Renderer::resize`].
    pub fn new(
        context: &'ctx VulkanContext,
        config: &RendererConfig,
        geometry: GeometryBuffers<'ctx>,
    ) -> VulkanResult<Self> {
        for format in [config.output_format.vk_format(), ACCUMULATION_FORMAT] {
            if !context.format_supports(format, vk::FormatFeatureFlags::STORAGE_IMAGE) {
                return Err(VulkanError::UnsupportedFormat(format));
            }
        }

        let mut pipeline = RaytracingPipeline::new(context, config.resolved_kernel_path())?;

        let mut uniform_buffer = Buffer::new(
            context,
            std::mem::size_of::<SceneParameters>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        uniform_buffer.map()?;

        pipeline.update_descriptor(
            bindings::SCENE_PARAMETERS,
            DescriptorResource::uniform_buffer(&uniform_buffer),
        )?;
        pipeline.update_descriptor(
            bindings::TRIANGLES,
            DescriptorResource::storage_buffer(geometry.triangles()),
        )?;
        pipeline.update_descriptor(bindings::SPHERES, DescriptorResource::storage_buffer(geometry.spheres()))?;

        let compute_stream = CommandStream::new(context, "compute")?;
        let copy_stream = CommandStream::new(context, "copy")?;

        let mut session = RenderSession::new();
        session.set_viewport(config.width, config.height);

        Ok(Self {
            context,
            compute_stream,
            copy_stream,
            targets: None,
            uniform_buffer,
            geometry,
            pipeline,
            session,
            output_format: config.output_format,
            started: Instant::now(),
        })
    }

    /// Recreate the resolution-dependent resources and restart accumulation
    ///
    /// Waits for the device before releasing anything a submitted command
    /// buffer may still reference. With an empty viewport the renderer stays
    /// not ready.
    pub fn reset(&mut self) -> VulkanResult<()> {
        self.session.begin_reset();

        // New views may reuse the handle values of the ones destroyed below
        self.pipeline.release_descriptors(&bindings::RESOLUTION_DEPENDENT);
        if self.targets.is_some() {
            self.context.wait_idle()?;
            self.targets = None;
        }

        if self.session.viewport_is_empty() {
            log::debug!("Viewport is empty, renderer stays idle");
            return Ok(());
        }

        let targets = RenderTargets::new(self.context, &self.session, self.output_format)?;

        self.pipeline.update_descriptor(
            bindings::OUTPUT_IMAGE,
            DescriptorResource::storage_image(&targets.output),
        )?;
        self.pipeline.update_descriptor(
            bindings::ACCUMULATION_IMAGE,
            DescriptorResource::storage_image(&targets.accumulation),
        )?;

        self.targets = Some(targets);
        self.session.finish_reset();
        Ok(())
    }

    /// Store a new viewport and reset
    pub fn resize(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        log::debug!("Resizing renderer to {}x{}", width, height);
        self.session.set_viewport(width, height);
        self.reset()
    }

    /// Dispatch one sample per pixel for `camera`
    ///
    /// Does nothing while the renderer is not ready.
    pub fn render(&mut self, camera: &CameraMatrices) -> VulkanResult<()> {
        if !self.session.is_ready() {
            log::trace!("Render skipped, renderer not ready");
            return Ok(());
        }

        // The previous dispatch may still be reading the uniform block
        self.compute_stream.wait()?;

        let parameters = SceneParameters::new(camera, self.session.frame_index(), self.elapsed_millis());
        self.uniform_buffer.map()?.write(0, &parameters)?;

        let (groups_x, groups_y) = self.session.work_groups();
        let recorder = self.compute_stream.begin()?;
        recorder.compute_memory_barrier();
        recorder.bind_compute_pipeline(self.pipeline.handle());
        recorder.bind_descriptor_set(self.pipeline.layout(), self.pipeline.descriptor_set());
        recorder.dispatch(groups_x, groups_y, 1);
        self.compute_stream.submit()?;

        log::trace!(
            "Dispatched frame {} as {}x{} work groups",
            self.session.frame_index(),
            groups_x,
            groups_y
        );
        self.session.advance();
        Ok(())
    }

    /// Copy the most recent dispatch's output into the readback buffer
    ///
    /// Blocks until the copy completes. Does nothing before the first
    /// dispatch after a reset.
    pub fn prepare_image(&mut self) -> VulkanResult<()> {
        if !self.session.is_ready() || !self.session.has_rendered() {
            return Ok(());
        }
        let Some(targets) = self.targets.as_mut() else {
            return Ok(());
        };

        let recorder = self.copy_stream.begin()?;
        targets
            .output
            .transition_and_copy_to_buffer(&recorder, &targets.readback)?;
        self.copy_stream.submit()?;
        self.copy_stream.wait()?;

        log::trace!("Copied frame {} to readback", self.session.frame_index() - 1);
        Ok(())
    }

    /// Copy the last prepared frame into `destination`
    ///
    /// `destination` must hold exactly `width * height * 4` bytes. Returns
    /// `false` and leaves `destination` untouched when nothing has been
    /// rendered since the last reset.
    pub fn copy_out(&mut self, destination: &mut [u8]) -> VulkanResult<bool> {
        if !self.session.is_ready() || !self.session.has_rendered() {
            return Ok(false);
        }
        let Some(targets) = self.targets.as_mut() else {
            return Ok(false);
        };

        let expected = self.session.frame_bytes();
        if destination.len() != expected {
            return Err(VulkanError::RegionOutOfBounds {
                offset: 0,
                len: destination.len(),
                capacity: expected,
            });
        }

        self.copy_stream.wait()?;
        targets.readback.map()?.read_into(0, destination)?;
        Ok(true)
    }

    /// Wait for the device, then release everything
    ///
    /// Dropping the renderer does the same but can only log a failed wait.
    pub fn dispose(self) -> VulkanResult<()> {
        self.context.wait_idle()?;
        drop(self);
        Ok(())
    }

    /// Session state snapshot
    pub const fn session(&self) -> RenderSession {
        self.session
    }

    /// Current viewport size
    pub const fn size(&self) -> (u32, u32) {
        self.session.viewport()
    }

    /// Index of the next frame to render
    pub const fn frame_index(&self) -> u32 {
        self.session.frame_index()
    }

    /// Whether render calls currently dispatch work
    pub const fn is_ready(&self) -> bool {
        self.session.is_ready()
    }

    /// Pixel format delivered by [`Renderer::copy_out`]
    pub const fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    /// Layouts of the output and accumulation images, if targets exist
    pub fn target_layouts(&self) -> Option<(ImageLayout, ImageLayout)> {
        self.targets
            .as_ref()
            .map(|targets| (targets.output.layout(), targets.accumulation.layout()))
    }

    /// Geometry bound to the pipeline
    pub const fn geometry(&self) -> &GeometryBuffers<'ctx> {
        &self.geometry
    }

    fn elapsed_millis(&self) -> u32 {
        // Wraps after about 49 days
        self.started.elapsed().as_millis() as u32
    }
}

impl Drop for Renderer<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::error!("Failed waiting for device idle before releasing renderer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::pipeline::ray_tracing_layout;
    use crate::render::vulkan::BindingTable;
    use ash::vk::Handle;

    fn ready_session(width: u32, height: u32) -> RenderSession {
        let mut session = RenderSession::new();
        session.set_viewport(width, height);
        session.begin_reset();
        session.finish_reset();
        session
    }

    #[test]
    fn test_new_session_is_not_ready() {
        let session = RenderSession::new();
        assert!(!session.is_ready());
        assert_eq!(session.frame_index(), 1);
        assert!(session.viewport_is_empty());
    }

    #[test]
    fn test_reset_restarts_at_frame_one() {
        let mut session = ready_session(64, 64);
        session.advance();
        session.advance();
        assert_eq!(session.frame_index(), 3);

        session.begin_reset();
        assert!(!session.is_ready());
        session.finish_reset();
        assert!(session.is_ready());
        assert_eq!(session.frame_index(), 1);
        assert!(!session.has_rendered());
    }

    #[test]
    fn test_frame_index_increments_by_one() {
        let mut session = ready_session(8, 8);
        for expected in 2..10 {
            session.advance();
            assert_eq!(session.frame_index(), expected);
        }
        assert!(session.has_rendered());
    }

    #[test]
    fn test_frame_index_saturates() {
        let mut session = ready_session(8, 8);
        session.frame_index = u32::MAX;
        session.advance();
        assert_eq!(session.frame_index(), u32::MAX);
    }

    #[test]
    fn test_work_groups_round_up() {
        assert_eq!(ready_session(64, 64).work_groups(), (4, 4));
        assert_eq!(ready_session(65, 17).work_groups(), (5, 2));
        assert_eq!(ready_session(1, 1).work_groups(), (1, 1));
    }

    #[test]
    fn test_frame_bytes_follow_viewport() {
        let mut session = ready_session(640, 480);
        assert_eq!(session.frame_bytes(), 640 * 480 * 4);

        session.set_viewport(32, 16);
        assert_eq!(session.frame_bytes(), 32 * 16 * 4);
    }

    #[test]
    fn test_resize_then_reset_resizes_readback() {
        let mut session = ready_session(32, 32);
        session.advance();
        assert_eq!(session.readback_size(), 32 * 32 * 4);

        session.set_viewport(48, 24);
        session.begin_reset();
        session.finish_reset();
        assert_eq!(session.readback_size(), 48 * 24 * 4);
        assert_eq!(session.readback_size() as usize, session.frame_bytes());
        assert!(!session.has_rendered());
    }

    #[test]
    fn test_reset_rebinds_recycled_target_views() {
        let mut table = BindingTable::new(ray_tracing_layout().kinds().clone());
        let buffer = |raw: u64, range| DescriptorResource::StorageBuffer(vk::Buffer::from_raw(raw), range);
        table
            .stage(bindings::SCENE_PARAMETERS, DescriptorResource::UniformBuffer(vk::Buffer::from_raw(1), 264))
            .unwrap();
        table.stage(bindings::TRIANGLES, buffer(2, 48)).unwrap();
        table.stage(bindings::SPHERES, buffer(3, 16)).unwrap();

        let output = DescriptorResource::StorageImage(vk::ImageView::from_raw(0x10));
        let accumulation = DescriptorResource::StorageImage(vk::ImageView::from_raw(0x20));
        for _ in 0..2 {
            table.release(&bindings::RESOLUTION_DEPENDENT);
            assert!(!table.is_complete());
            assert!(table.stage(bindings::OUTPUT_IMAGE, output).unwrap());
            assert!(table.stage(bindings::ACCUMULATION_IMAGE, accumulation).unwrap());
            assert!(table.is_complete());
        }
    }

    #[test]
    fn test_targets_must_be_general() {
        assert!(check_bindable(ImageLayout::General, ImageLayout::General).is_ok());
        assert!(matches!(
            check_bindable(ImageLayout::General, ImageLayout::TransferDst),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert!(check_bindable(ImageLayout::TransferSrc, ImageLayout::General).is_err());
    }

    #[test]
    fn test_viewport_emptiness() {
        let mut session = RenderSession::new();
        session.set_viewport(0, 100);
        assert!(session.viewport_is_empty());
        session.set_viewport(100, 1);
        assert!(!session.viewport_is_empty());
    }
}
