//! Compute pipeline and descriptor setup for the ray-tracing kernel

use ash::{vk, Device};
use std::path::Path;

use super::vulkan::{
    DescriptorPool, DescriptorResource, DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutBuilder,
    ShaderModule, VulkanContext, VulkanError, VulkanResult,
};

/// Binding indices of the kernel's descriptor set
pub mod bindings {
    /// Output storage image
    pub const OUTPUT_IMAGE: u32 = 0;
    /// `SceneParameters` uniform block
    pub const SCENE_PARAMETERS: u32 = 1;
    /// Float accumulation storage image
    pub const ACCUMULATION_IMAGE: u32 = 2;
    /// Triangle records
    pub const TRIANGLES: u32 = 3;
    /// Sphere records
    pub const SPHERES: u32 = 4;

    /// Bindings whose images are recreated when the viewport changes
    pub const RESOLUTION_DEPENDENT: [u32; 2] = [OUTPUT_IMAGE, ACCUMULATION_IMAGE];
}

/// Descriptor set layout consumed by the ray-tracing kernel
pub fn ray_tracing_layout() -> DescriptorSetLayoutBuilder {
    let stage = vk::ShaderStageFlags::COMPUTE;
    DescriptorSetLayoutBuilder::new()
        .add_storage_image(bindings::OUTPUT_IMAGE, stage)
        .add_uniform_buffer(bindings::SCENE_PARAMETERS, stage)
        .add_storage_image(bindings::ACCUMULATION_IMAGE, stage)
        .add_storage_buffer(bindings::TRIANGLES, stage)
        .add_storage_buffer(bindings::SPHERES, stage)
}

/// Pipeline and pipeline layout, destroyed in that order
struct ComputePipelineHandles {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl Drop for ComputePipelineHandles {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Compute pipeline with its descriptor pool, set layout and single set
///
/// Fields drop in declaration order: pool (freeing the set), set layout,
/// pipeline, pipeline layout.
pub struct RaytracingPipeline {
    descriptor_set: DescriptorSet,
    descriptor_pool: DescriptorPool,
    set_layout: DescriptorSetLayout,
    handles: ComputePipelineHandles,
}

impl RaytracingPipeline {
    /// Build the pipeline for the kernel at `kernel_path` with the standard layout
    pub fn new(context: &VulkanContext, kernel_path: impl AsRef<Path>) -> VulkanResult<Self> {
        Self::with_layout(context, kernel_path, ray_tracing_layout())
    }

    /// Build the pipeline for the kernel at `kernel_path` with a custom layout
    ///
    /// The kernel module is released as soon as the pipeline exists.
    pub fn with_layout(
        context: &VulkanContext,
        kernel_path: impl AsRef<Path>,
        layout: DescriptorSetLayoutBuilder,
    ) -> VulkanResult<Self> {
        let kernel_path = kernel_path.as_ref();
        let device = context.device();
        let module = ShaderModule::from_file(device.clone(), kernel_path)?;

        let set_layout = layout.build(device)?;
        let descriptor_pool = DescriptorPool::for_layout(device.clone(), &set_layout, 1)?;
        let descriptor_set = descriptor_pool.allocate(&set_layout)?;

        let set_layouts = [set_layout.handle()];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(VulkanError::Api)?;

        let mut handles = ComputePipelineHandles {
            device: device.clone(),
            pipeline: vk::Pipeline::null(),
            layout: pipeline_layout,
        };

        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(module.compute_stage_info())
            .layout(pipeline_layout)
            .build();
        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, e)| VulkanError::Api(e))?;
        handles.pipeline = pipelines.into_iter().next().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "driver returned no compute pipeline".to_string(),
        })?;

        drop(module);
        log::info!("Created compute pipeline from {:?}", kernel_path);

        Ok(Self {
            descriptor_set,
            descriptor_pool,
            set_layout,
            handles,
        })
    }

    /// Get the pipeline handle
    pub const fn handle(&self) -> vk::Pipeline {
        self.handles.pipeline
    }

    /// Get the pipeline layout handle
    pub const fn layout(&self) -> vk::PipelineLayout {
        self.handles.layout
    }

    /// Get the descriptor set handle
    pub const fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set.handle()
    }

    /// Get the descriptor set layout
    pub const fn set_layout(&self) -> &DescriptorSetLayout {
        &self.set_layout
    }

    /// Pool the descriptor set was allocated from
    pub const fn descriptor_pool(&self) -> &DescriptorPool {
        &self.descriptor_pool
    }

    /// Resource currently bound at `binding`
    pub fn bound(&self, binding: u32) -> Option<DescriptorResource> {
        self.descriptor_set.bindings().get(binding)
    }

    /// Overwrite one binding in place
    ///
    /// No command buffer referencing the set may be in flight.
    pub fn update_descriptor(&mut self, binding: u32, resource: DescriptorResource) -> VulkanResult<()> {
        self.descriptor_set.update(binding, resource)
    }

    /// Drop the cached resources of `bindings`; the next update always writes
    pub fn release_descriptors(&mut self, bindings: &[u32]) {
        self.descriptor_set.release(bindings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::vulkan::DescriptorKind;

    #[test]
    fn test_layout_matches_kernel_bindings() {
        let layout = ray_tracing_layout();
        let kinds = layout.kinds();

        assert_eq!(kinds.len(), 5);
        assert_eq!(kinds[&bindings::OUTPUT_IMAGE], DescriptorKind::StorageImage);
        assert_eq!(kinds[&bindings::SCENE_PARAMETERS], DescriptorKind::UniformBuffer);
        assert_eq!(kinds[&bindings::ACCUMULATION_IMAGE], DescriptorKind::StorageImage);
        assert_eq!(kinds[&bindings::TRIANGLES], DescriptorKind::StorageBuffer);
        assert_eq!(kinds[&bindings::SPHERES], DescriptorKind::StorageBuffer);
    }

    #[test]
    fn test_resolution_dependent_bindings_are_images() {
        let layout = ray_tracing_layout();
        for binding in bindings::RESOLUTION_DEPENDENT {
            assert_eq!(layout.kinds()[&binding], DescriptorKind::StorageImage);
        }
        let images = layout
            .kinds()
            .values()
            .filter(|kind| **kind == DescriptorKind::StorageImage)
            .count();
        assert_eq!(images, bindings::RESOLUTION_DEPENDENT.len());
    }
}
