//! Vulkan descriptor set and resource binding management
//!
//! The ray tracer uses one descriptor set with a fixed binding table. Each
//! binding is declared with a [`DescriptorKind`]; [`DescriptorSet::update`]
//! checks the supplied resource against that kind and skips the write when
//! the binding already holds the same resource. Bindings whose resource is
//! destroyed must be released first, since a recreated object can reuse the
//! old handle value.
//!
//! Updates are only safe while no submitted command buffer references the
//! set. The renderer guarantees this by draining the device before it
//! rebinds resources on reset.

use ash::{vk, Device};
use std::collections::BTreeMap;

use super::buffer::Buffer;
use super::image::Image;
use super::{VulkanError, VulkanResult};

/// Resource kind a binding accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    /// Read/write image in the `General` layout
    StorageImage,
    /// Read-only uniform block
    UniformBuffer,
    /// Read/write storage block
    StorageBuffer,
}

impl DescriptorKind {
    /// Matching Vulkan descriptor type
    pub const fn vk_type(self) -> vk::DescriptorType {
        match self {
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// A resource ready to be written into a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    /// Storage image view, bound in `General`
    StorageImage(vk::ImageView),
    /// Uniform buffer and the byte range bound from its start
    UniformBuffer(vk::Buffer, vk::DeviceSize),
    /// Storage buffer and the byte range bound from its start
    StorageBuffer(vk::Buffer, vk::DeviceSize),
}

impl DescriptorResource {
    /// Bind `image` as a storage image
    pub fn storage_image(image: &Image<'_>) -> Self {
        Self::StorageImage(image.descriptor_info().image_view)
    }

    /// Bind `buffer` as a uniform buffer
    pub fn uniform_buffer(buffer: &Buffer<'_>) -> Self {
        let info = buffer.descriptor_info();
        Self::UniformBuffer(info.buffer, info.range)
    }

    /// Bind `buffer` as a storage buffer
    pub fn storage_buffer(buffer: &Buffer<'_>) -> Self {
        let info = buffer.descriptor_info();
        Self::StorageBuffer(info.buffer, info.range)
    }

    /// Kind of binding this resource fits
    pub const fn kind(&self) -> DescriptorKind {
        match self {
            Self::StorageImage(_) => DescriptorKind::StorageImage,
            Self::UniformBuffer(..) => DescriptorKind::UniformBuffer,
            Self::StorageBuffer(..) => DescriptorKind::StorageBuffer,
        }
    }
}

/// Descriptor set layout builder for creating reusable layouts
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
    kinds: BTreeMap<u32, DescriptorKind>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self::default()
    }

    fn add(mut self, binding: u32, kind: DescriptorKind, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(kind.vk_type())
                .descriptor_count(1)
                .stage_flags(stage_flags)
                .build(),
        );
        self.kinds.insert(binding, kind);
        self
    }

    /// Add a storage image binding
    #[must_use]
    pub fn add_storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, DescriptorKind::StorageImage, stage_flags)
    }

    /// Add a uniform buffer binding
    #[must_use]
    pub fn add_uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, DescriptorKind::UniformBuffer, stage_flags)
    }

    /// Add a storage buffer binding
    #[must_use]
    pub fn add_storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, DescriptorKind::StorageBuffer, stage_flags)
    }

    /// Declared binding kinds
    pub const fn kinds(&self) -> &BTreeMap<u32, DescriptorKind> {
        &self.kinds
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        if self.kinds.len() != self.bindings.len() {
            return Err(VulkanError::InvalidOperation {
                reason: "descriptor binding declared twice".to_string(),
            });
        }

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            kinds: self.kinds,
        })
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    kinds: BTreeMap<u32, DescriptorKind>,
}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub const fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Binding index to kind
    pub const fn kinds(&self) -> &BTreeMap<u32, DescriptorKind> {
        &self.kinds
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Pool sizes covering `max_sets` copies of a layout with these bindings
pub fn pool_sizes_for<'a>(
    kinds: impl IntoIterator<Item = &'a DescriptorKind>,
    max_sets: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let mut counts: BTreeMap<DescriptorKind, u32> = BTreeMap::new();
    for kind in kinds {
        *counts.entry(*kind).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(kind, count)| {
            vk::DescriptorPoolSize::builder()
                .ty(kind.vk_type())
                .descriptor_count(count * max_sets)
                .build()
        })
        .collect()
}

/// Descriptor pool for allocating descriptor sets
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Device,
}

impl DescriptorPool {
    /// Create a pool sized for `max_sets` sets of `layout`
    pub fn for_layout(device: Device, layout: &DescriptorSetLayout, max_sets: u32) -> VulkanResult<Self> {
        let pool_sizes = pool_sizes_for(layout.kinds().values(), max_sets);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(Self { pool, device })
    }

    /// Allocate one set of `layout`
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> VulkanResult<DescriptorSet> {
        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(VulkanError::Api)?;
        let set = sets.into_iter().next().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "driver returned no descriptor set".to_string(),
        })?;

        Ok(DescriptorSet {
            set,
            device: self.device.clone(),
            bindings: BindingTable::new(layout.kinds().clone()),
        })
    }

    /// Return a set to the pool
    pub fn free(&self, set: DescriptorSet) -> VulkanResult<()> {
        unsafe { self.device.free_descriptor_sets(self.pool, &[set.set]) }.map_err(VulkanError::Api)
    }

    /// Get the pool handle
    pub const fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Host-side mirror of what each binding currently holds
#[derive(Debug, Clone)]
pub struct BindingTable {
    kinds: BTreeMap<u32, DescriptorKind>,
    bound: BTreeMap<u32, DescriptorResource>,
}

impl BindingTable {
    /// Empty table for the declared bindings
    pub const fn new(kinds: BTreeMap<u32, DescriptorKind>) -> Self {
        Self {
            kinds,
            bound: BTreeMap::new(),
        }
    }

    /// Record `resource` for `binding`; returns whether a descriptor write is needed
    pub fn stage(&mut self, binding: u32, resource: DescriptorResource) -> VulkanResult<bool> {
        let expected = *self.kinds.get(&binding).ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("binding {binding} is not declared in the layout"),
        })?;
        if resource.kind() != expected {
            return Err(VulkanError::DescriptorMismatch {
                binding,
                expected,
                found: resource.kind(),
            });
        }

        if self.bound.get(&binding) == Some(&resource) {
            return Ok(false);
        }
        self.bound.insert(binding, resource);
        Ok(true)
    }

    /// Forget what `bindings` hold so the next stage always writes
    pub fn release(&mut self, bindings: &[u32]) {
        for binding in bindings {
            self.bound.remove(binding);
        }
    }

    /// Resource currently recorded for `binding`
    pub fn get(&self, binding: u32) -> Option<DescriptorResource> {
        self.bound.get(&binding).copied()
    }

    /// Whether every declared binding holds a resource
    pub fn is_complete(&self) -> bool {
        self.kinds.keys().all(|binding| self.bound.contains_key(binding))
    }
}

/// The allocated set together with its binding table
pub struct DescriptorSet {
    set: vk::DescriptorSet,
    device: Device,
    bindings: BindingTable,
}

impl DescriptorSet {
    /// Get the descriptor set handle
    pub const fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Current binding table
    pub const fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    /// Mark `bindings` stale ahead of destroying the resources they reference
    pub fn release(&mut self, bindings: &[u32]) {
        self.bindings.release(bindings);
    }

    /// Overwrite one binding in place
    ///
    /// Rebinding the resource a binding already holds performs no write.
    pub fn update(&mut self, binding: u32, resource: DescriptorResource) -> VulkanResult<()> {
        if !self.bindings.stage(binding, resource)? {
            return Ok(());
        }

        let image_info;
        let buffer_info;
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(binding)
            .dst_array_element(0)
            .descriptor_type(resource.kind().vk_type());

        let write = match resource {
            DescriptorResource::StorageImage(view) => {
                image_info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view,
                    image_layout: vk::ImageLayout::GENERAL,
                }];
                write.image_info(&image_info).build()
            }
            DescriptorResource::UniformBuffer(buffer, range)
            | DescriptorResource::StorageBuffer(buffer, range) => {
                buffer_info = [vk::DescriptorBufferInfo {
                    buffer,
                    offset: 0,
                    range,
                }];
                write.buffer_info(&buffer_info).build()
            }
        };

        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        log::debug!("Updated descriptor binding {} ({:?})", binding, resource.kind());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn ray_tracing_kinds() -> BTreeMap<u32, DescriptorKind> {
        BTreeMap::from([
            (0, DescriptorKind::StorageImage),
            (1, DescriptorKind::UniformBuffer),
            (2, DescriptorKind::StorageImage),
            (3, DescriptorKind::StorageBuffer),
            (4, DescriptorKind::StorageBuffer),
        ])
    }

    #[test]
    fn test_rebinding_same_resource_is_idempotent() {
        let mut table = BindingTable::new(ray_tracing_kinds());
        let view = DescriptorResource::StorageImage(vk::ImageView::from_raw(7));

        assert!(table.stage(0, view).unwrap());
        assert!(!table.stage(0, view).unwrap());
        assert_eq!(table.get(0), Some(view));
    }

    #[test]
    fn test_rebinding_new_resource_overwrites() {
        let mut table = BindingTable::new(ray_tracing_kinds());
        let first = DescriptorResource::StorageImage(vk::ImageView::from_raw(1));
        let second = DescriptorResource::StorageImage(vk::ImageView::from_raw(2));

        table.stage(2, first).unwrap();
        assert!(table.stage(2, second).unwrap());
        assert_eq!(table.get(2), Some(second));
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let mut table = BindingTable::new(ray_tracing_kinds());
        let result = table.stage(1, DescriptorResource::StorageBuffer(vk::Buffer::from_raw(3), 16));

        assert!(matches!(
            result,
            Err(VulkanError::DescriptorMismatch {
                binding: 1,
                expected: DescriptorKind::UniformBuffer,
                found: DescriptorKind::StorageBuffer,
            })
        ));
        assert_eq!(table.get(1), None);
    }

    #[test]
    fn test_undeclared_binding_is_rejected() {
        let mut table = BindingTable::new(ray_tracing_kinds());
        let result = table.stage(9, DescriptorResource::UniformBuffer(vk::Buffer::from_raw(1), 264));
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
    }

    #[test]
    fn test_table_completion() {
        let mut table = BindingTable::new(BTreeMap::from([
            (0, DescriptorKind::StorageImage),
            (1, DescriptorKind::UniformBuffer),
        ]));
        table.stage(0, DescriptorResource::StorageImage(vk::ImageView::from_raw(1))).unwrap();
        assert!(!table.is_complete());
        table.stage(1, DescriptorResource::UniformBuffer(vk::Buffer::from_raw(1), 264)).unwrap();
        assert!(table.is_complete());
    }

    #[test]
    fn test_released_binding_rewrites_recycled_handle() {
        let mut table = BindingTable::new(ray_tracing_kinds());
        let output = DescriptorResource::StorageImage(vk::ImageView::from_raw(0x5555_0000));
        let accumulation = DescriptorResource::StorageImage(vk::ImageView::from_raw(0x5555_1000));
        table.stage(0, output).unwrap();
        table.stage(2, accumulation).unwrap();

        // Views destroyed and recreated by the driver at the same addresses
        table.release(&[0, 2]);
        assert_eq!(table.get(0), None);
        assert!(table.stage(0, output).unwrap());
        assert!(table.stage(2, accumulation).unwrap());
    }

    #[test]
    fn test_release_leaves_other_bindings() {
        let mut table = BindingTable::new(ray_tracing_kinds());
        let uniform = DescriptorResource::UniformBuffer(vk::Buffer::from_raw(4), 264);
        table.stage(0, DescriptorResource::StorageImage(vk::ImageView::from_raw(1))).unwrap();
        table.stage(1, uniform).unwrap();
        table.stage(2, DescriptorResource::StorageImage(vk::ImageView::from_raw(2))).unwrap();
        table.stage(3, DescriptorResource::StorageBuffer(vk::Buffer::from_raw(5), 48)).unwrap();
        table.stage(4, DescriptorResource::StorageBuffer(vk::Buffer::from_raw(6), 16)).unwrap();
        assert!(table.is_complete());

        table.release(&[0, 2]);
        assert!(!table.is_complete());
        assert_eq!(table.get(1), Some(uniform));
        assert!(!table.stage(1, uniform).unwrap());
    }

    #[test]
    fn test_pool_sizes_count_each_kind() {
        let kinds = ray_tracing_kinds();
        let sizes = pool_sizes_for(kinds.values(), 1);

        let count = |ty: vk::DescriptorType| {
            sizes
                .iter()
                .find(|size| size.ty == ty)
                .map(|size| size.descriptor_count)
        };
        assert_eq!(sizes.len(), 3);
        assert_eq!(count(vk::DescriptorType::STORAGE_IMAGE), Some(2));
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), Some(1));
        assert_eq!(count(vk::DescriptorType::STORAGE_BUFFER), Some(2));
    }

    #[test]
    fn test_builder_records_kinds() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_storage_image(0, vk::ShaderStageFlags::COMPUTE)
            .add_uniform_buffer(1, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(builder.kinds().get(&0), Some(&DescriptorKind::StorageImage));
        assert_eq!(builder.kinds().get(&1), Some(&DescriptorKind::UniformBuffer));
    }
}
