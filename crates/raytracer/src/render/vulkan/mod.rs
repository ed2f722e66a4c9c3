//! Vulkan backend
//!
//! Thin RAII wrappers over `ash` for a headless compute workload: context
//! bring-up, memory selection, buffers, images with a checked layout state
//! machine, command recording, fences, kernel modules and descriptor sets.

pub mod buffer;
pub mod commands;
pub mod context;
pub mod descriptor_set;
pub mod image;
pub mod memory;
pub mod shader;
pub mod sync;

pub use buffer::{Buffer, MappedRegion};
pub use commands::{CommandRecorder, CommandStream};
pub use context::{PhysicalDeviceInfo, VulkanContext, VulkanError, VulkanInstance, VulkanResult};
pub use descriptor_set::{
    BindingTable, DescriptorKind, DescriptorPool, DescriptorResource, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBuilder,
};
pub use image::{Image, ImageLayout, LayoutTransition};
pub use shader::ShaderModule;
pub use sync::Fence;
