//! Device memory helpers
//!
//! Memory-type resolution and offset alignment. Kept free of device handles so
//! the selection rules can be checked against synthetic property tables.

use ash::vk;

/// Index of the first memory type allowed by `type_bits` that has every flag in `properties`
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = memory_properties
        .memory_type_count
        .min(vk::MAX_MEMORY_TYPES as u32) as usize;

    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(index, _)| index as u32)
}

/// Round `size` up to the next multiple of `alignment`
///
/// An alignment of zero leaves the size unchanged.
pub const fn align_size(size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment == 0 || size == 0 {
        return size;
    }
    ((size - 1) / alignment + 1) * alignment
}

/// Minimum offset alignment the device imposes on a buffer with `usage`
///
/// Uniform and storage usage each carry their own limit; a buffer used as both
/// takes the stricter of the two. Other usages impose none.
pub fn min_offset_alignment(
    limits: &vk::PhysicalDeviceLimits,
    usage: vk::BufferUsageFlags,
) -> vk::DeviceSize {
    let mut alignment: vk::DeviceSize = 0;
    if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
        alignment = alignment.max(limits.min_uniform_buffer_offset_alignment);
    }
    if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
        alignment = alignment.max(limits.min_storage_buffer_offset_alignment);
    }
    alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_table(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (slot, flag) in properties.memory_types.iter_mut().zip(flags) {
            slot.property_flags = *flag;
        }
        properties
    }

    #[test]
    fn test_align_rounds_up_to_multiple() {
        assert_eq!(align_size(100, 64), 128);
        assert_eq!(align_size(128, 64), 128);
        assert_eq!(align_size(1, 256), 256);
        assert_eq!(align_size(264, 16), 272);
    }

    #[test]
    fn test_align_with_zero_alignment_is_identity() {
        assert_eq!(align_size(100, 0), 100);
        assert_eq!(align_size(0, 64), 0);
    }

    #[test]
    fn test_memory_type_respects_type_bits() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let table = memory_table(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, host, host]);

        assert_eq!(find_memory_type_index(&table, 0b111, host), Some(1));
        assert_eq!(find_memory_type_index(&table, 0b100, host), Some(2));
        assert_eq!(find_memory_type_index(&table, 0b001, host), None);
    }

    #[test]
    fn test_memory_type_requires_all_flags() {
        let table = memory_table(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED;
        assert_eq!(find_memory_type_index(&table, u32::MAX, wanted), Some(1));
    }

    #[test]
    fn test_types_past_count_are_ignored() {
        let mut table = memory_table(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        table.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(
            find_memory_type_index(&table, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn test_offset_alignment_per_usage() {
        let limits = vk::PhysicalDeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            ..Default::default()
        };

        assert_eq!(min_offset_alignment(&limits, vk::BufferUsageFlags::UNIFORM_BUFFER), 256);
        assert_eq!(min_offset_alignment(&limits, vk::BufferUsageFlags::STORAGE_BUFFER), 64);
        assert_eq!(
            min_offset_alignment(
                &limits,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER
            ),
            256
        );
        assert_eq!(min_offset_alignment(&limits, vk::BufferUsageFlags::TRANSFER_SRC), 0);
    }
}
