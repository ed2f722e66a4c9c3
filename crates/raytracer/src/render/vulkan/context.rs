//! Vulkan context management
//!
//! Headless compute context: instance, physical device, a logical device with a
//! single graphics/compute queue, and the command pool every other GPU object
//! records from. All resources borrow the context and must be dropped before it.

use ash::extensions::ext::DebugUtils;
use ash::{vk, Device, Entry, Instance};
use std::ffi::{c_char, CStr, CString};
use std::path::PathBuf;
use thiserror::Error;

use super::commands::CommandRecorder;
use super::descriptor_set::DescriptorKind;
use super::image::ImageLayout;
use super::memory;
use crate::core::config::ContextConfig;

const ENGINE_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"Raytracer\0") };
const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };
const PORTABILITY_ENUMERATION: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_KHR_portability_enumeration\0") };
const PORTABILITY_SUBSET: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_KHR_portability_subset\0") };

/// `VK_INSTANCE_CREATE_ENUMERATE_PORTABILITY_BIT_KHR`
const ENUMERATE_PORTABILITY: vk::InstanceCreateFlags = vk::InstanceCreateFlags::from_raw(0x1);

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The Vulkan loader could not be found or opened
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No memory type matches both the resource's type bits and the requested properties
    #[error("No suitable memory type (type bits {type_bits:#b}, properties {properties:?})")]
    NoSuitableMemoryType {
        /// Memory types the resource may live in
        type_bits: u32,
        /// Property flags that were requested
        properties: vk::MemoryPropertyFlags,
    },

    /// No queue family can run compute work
    #[error("No queue family supports compute")]
    NoSuitableQueueFamily,

    /// Image layout transition outside the supported table
    #[error("Unsupported layout transition: {from:?} -> {to:?}")]
    UnsupportedLayoutTransition {
        /// Current layout
        from: ImageLayout,
        /// Requested layout
        to: ImageLayout,
    },

    /// Format lacks a feature the renderer depends on
    #[error("Format {0:?} cannot be used as a storage image")]
    UnsupportedFormat(vk::Format),

    /// Kernel binary could not be read
    #[error("Failed to read shader {path:?}: {source}")]
    ShaderLoad {
        /// Path that was read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Kernel bytes are not valid SPIR-V
    #[error("Invalid SPIR-V: {0}")]
    InvalidSpirv(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Resource kind does not match the binding's declared descriptor type
    #[error("Binding {binding} expects {expected:?}, got {found:?}")]
    DescriptorMismatch {
        /// Binding index
        binding: u32,
        /// Kind declared in the set layout
        expected: DescriptorKind,
        /// Kind that was supplied
        found: DescriptorKind,
    },

    /// Access outside a mapped region
    #[error("Access of {len} bytes at offset {offset} exceeds region of {capacity} bytes")]
    RegionOutOfBounds {
        /// Start of the access
        offset: usize,
        /// Length of the access
        len: usize,
        /// Size of the region
        capacity: usize,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    entry: Entry,
    instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create a Vulkan 1.2 instance, with validation when requested and available
    pub fn new(config: &ContextConfig) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| VulkanError::Loading(e.to_string()))?;

        let app_name = CString::new(config.application_name.as_str()).map_err(|_| {
            VulkanError::InitializationFailed("application name contains a NUL byte".to_string())
        })?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let validation = config.validation_enabled() && Self::validation_layer_available(&entry)?;
        if config.validation_enabled() && !validation {
            log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }

        let mut extensions: Vec<*const c_char> = Vec::new();
        let mut flags = vk::InstanceCreateFlags::empty();
        if cfg!(target_os = "macos") {
            extensions.push(PORTABILITY_ENUMERATION.as_ptr());
            flags |= ENUMERATE_PORTABILITY;
        }
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }
        let layers: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.map_err(VulkanError::Api)?;

        let debug = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::create_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::info!("Created Vulkan instance (validation: {})", validation);

        Ok(Self {
            entry,
            instance,
            debug,
        })
    }

    fn validation_layer_available(entry: &Entry) -> VulkanResult<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(VulkanError::Api)?;
        Ok(layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        }))
    }

    fn create_debug_messenger(
        debug_utils: &DebugUtils,
    ) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(VulkanError::Api)
    }

    /// Vulkan entry point
    pub const fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Vulkan instance handle
    pub const fn handle(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// First queue family that can run compute work, preferring one that also does graphics
pub fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    let usable = |family: &vk::QueueFamilyProperties, flags: vk::QueueFlags| {
        family.queue_count > 0 && family.queue_flags.contains(flags)
    };

    families
        .iter()
        .position(|family| usable(family, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
        .or_else(|| {
            families
                .iter()
                .position(|family| usable(family, vk::QueueFlags::COMPUTE))
        })
        .map(|index| index as u32)
}

/// Index of the device to use: a discrete GPU when preferred and present, else the first
pub fn pick_device_index(device_types: &[vk::PhysicalDeviceType], prefer_discrete: bool) -> Option<usize> {
    if device_types.is_empty() {
        return None;
    }
    if prefer_discrete {
        if let Some(index) = device_types
            .iter()
            .position(|ty| *ty == vk::PhysicalDeviceType::DISCRETE_GPU)
        {
            return Some(index);
        }
    }
    Some(0)
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types, cached for allocation
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the compute-capable queue family
    pub queue_family: u32,
    /// Device exposes `VK_KHR_portability_subset` and must enable it
    pub portability_subset: bool,
}

impl PhysicalDeviceInfo {
    /// Select a device that has a compute-capable queue family
    pub fn select(instance: &Instance, prefer_discrete: bool) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(VulkanError::Api)?;
        if devices.is_empty() {
            return Err(VulkanError::InitializationFailed(
                "No Vulkan-capable GPU found".to_string(),
            ));
        }

        let candidates: Vec<(vk::PhysicalDevice, vk::PhysicalDeviceProperties, u32)> = devices
            .into_iter()
            .filter_map(|device| {
                let families =
                    unsafe { instance.get_physical_device_queue_family_properties(device) };
                let family = select_queue_family(&families)?;
                let properties = unsafe { instance.get_physical_device_properties(device) };
                Some((device, properties, family))
            })
            .collect();

        let device_types: Vec<vk::PhysicalDeviceType> =
            candidates.iter().map(|(_, properties, _)| properties.device_type).collect();
        let index = pick_device_index(&device_types, prefer_discrete)
            .ok_or(VulkanError::NoSuitableQueueFamily)?;
        let (device, properties, queue_family) = candidates[index];

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .map_err(VulkanError::Api)?;
        let portability_subset = extensions.iter().any(|extension| {
            let name = unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) };
            name == PORTABILITY_SUBSET
        });

        let info = Self {
            device,
            properties,
            features: unsafe { instance.get_physical_device_features(device) },
            memory_properties: unsafe { instance.get_physical_device_memory_properties(device) },
            queue_family,
            portability_subset,
        };

        log::info!(
            "Selected GPU: {} ({:?}), queue family {}",
            info.name(),
            info.properties.device_type,
            queue_family
        );

        Ok(info)
    }

    /// Human-readable device name
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Queue used for compute dispatch and transfers
    pub queue: vk::Queue,
}

impl LogicalDevice {
    /// Create the logical device with one queue from the selected family
    pub fn new(instance: &Instance, physical_device: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical_device.queue_family)
            .queue_priorities(&priorities)
            .build()];

        // The path-tracing kernel writes its output image without a format qualifier.
        let write_without_format =
            physical_device.features.shader_storage_image_write_without_format == vk::TRUE;
        if !write_without_format {
            log::warn!("shaderStorageImageWriteWithoutFormat unsupported; kernels must declare output formats");
        }
        let features = vk::PhysicalDeviceFeatures::builder()
            .shader_storage_image_write_without_format(write_without_format)
            .build();

        let mut extensions: Vec<*const c_char> = Vec::new();
        if physical_device.portability_subset {
            extensions.push(PORTABILITY_SUBSET.as_ptr());
        }

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device.device, &create_info, None) }
            .map_err(VulkanError::Api)?;
        let queue = unsafe { device.get_device_queue(physical_device.queue_family, 0) };

        Ok(Self { device, queue })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Main Vulkan context that owns all core Vulkan resources
///
/// Field order is drop order: the device goes before the instance.
pub struct VulkanContext {
    command_pool: vk::CommandPool,
    device: LogicalDevice,
    physical_device: PhysicalDeviceInfo,
    instance: VulkanInstance,
}

impl VulkanContext {
    /// Bring up instance, device, queue and command pool
    pub fn new(config: &ContextConfig) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(config)?;
        let physical_device = PhysicalDeviceInfo::select(instance.handle(), config.prefer_discrete_gpu)?;
        let device = LogicalDevice::new(instance.handle(), &physical_device)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(physical_device.queue_family);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .map_err(VulkanError::Api)?;

        Ok(Self {
            command_pool,
            device,
            physical_device,
            instance,
        })
    }

    /// Get the Vulkan instance
    pub const fn instance(&self) -> &Instance {
        self.instance.handle()
    }

    /// Get the logical device
    pub const fn device(&self) -> &Device {
        &self.device.device
    }

    /// Get the physical device info
    pub const fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical_device
    }

    /// Device limits (alignment, dispatch sizes)
    pub const fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.physical_device.properties.limits
    }

    /// Get the compute queue
    pub const fn queue(&self) -> vk::Queue {
        self.device.queue
    }

    /// Get the compute queue family index
    pub const fn queue_family_index(&self) -> u32 {
        self.physical_device.queue_family
    }

    /// Get the command pool handle
    pub const fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Resolve a memory type index
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<u32> {
        memory::find_memory_type_index(&self.physical_device.memory_properties, type_bits, properties)
            .ok_or(VulkanError::NoSuitableMemoryType {
                type_bits,
                properties,
            })
    }

    /// Allocate a memory block satisfying `requirements` with the given properties
    pub fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<vk::DeviceMemory> {
        let memory_type_index = self.find_memory_type(requirements.memory_type_bits, properties)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        unsafe { self.device().allocate_memory(&alloc_info, None) }.map_err(VulkanError::Api)
    }

    /// Whether images of `format` with optimal tiling support `features`
    pub fn format_supports(&self, format: vk::Format, features: vk::FormatFeatureFlags) -> bool {
        let properties = unsafe {
            self.instance()
                .get_physical_device_format_properties(self.physical_device.device, format)
        };
        properties.optimal_tiling_features.contains(features)
    }

    /// Allocate a primary command buffer from the context's pool
    pub fn allocate_command_buffer(&self) -> VulkanResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device().allocate_command_buffers(&alloc_info) }
            .map_err(VulkanError::Api)?;
        buffers.into_iter().next().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "driver returned no command buffer".to_string(),
        })
    }

    /// Return a command buffer to the pool; it must not be pending
    pub fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device()
                .free_command_buffers(self.command_pool, &[command_buffer]);
        }
    }

    /// Allocate a short-lived command buffer and begin recording
    pub fn begin_single_time_commands(&self) -> VulkanResult<vk::CommandBuffer> {
        let command_buffer = self.allocate_command_buffer()?;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = unsafe { self.device().begin_command_buffer(command_buffer, &begin_info) } {
            self.free_command_buffer(command_buffer);
            return Err(VulkanError::Api(e));
        }
        Ok(command_buffer)
    }

    /// Finish, submit alone, block until the queue drains, then free the buffer
    ///
    /// For setup work only; the per-frame path uses fence-guarded streams.
    pub fn end_single_time_commands(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let result = self.submit_and_drain(command_buffer);
        self.free_command_buffer(command_buffer);
        result
    }

    fn submit_and_drain(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe {
            self.device()
                .end_command_buffer(command_buffer)
                .map_err(VulkanError::Api)?;
        }
        self.submit(command_buffer, vk::Fence::null())?;
        self.wait_for_queue()
    }

    /// Record through `record` into a one-shot command buffer and execute it
    pub fn execute_single_time<F>(&self, record: F) -> VulkanResult<()>
    where
        F: FnOnce(&CommandRecorder<'_>) -> VulkanResult<()>,
    {
        let command_buffer = self.begin_single_time_commands()?;
        match record(&CommandRecorder::new(self.device(), command_buffer)) {
            Ok(()) => self.end_single_time_commands(command_buffer),
            Err(e) => {
                self.free_command_buffer(command_buffer);
                Err(e)
            }
        }
    }

    /// Submit one recorded command buffer, signalling `fence` on completion
    pub fn submit(&self, command_buffer: vk::CommandBuffer, fence: vk::Fence) -> VulkanResult<()> {
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            self.device()
                .queue_submit(self.queue(), &[submit_info.build()], fence)
                .map_err(VulkanError::Api)
        }
    }

    /// Block until the queue has no pending work
    pub fn wait_for_queue(&self) -> VulkanResult<()> {
        unsafe { self.device().queue_wait_idle(self.queue()) }.map_err(VulkanError::Api)
    }

    /// Block until the whole device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device().device_wait_idle() }.map_err(VulkanError::Api)
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.device
                .device
                .destroy_command_pool(self.command_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn test_queue_family_prefers_graphics_and_compute() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::COMPUTE, 2),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
        ];
        assert_eq!(select_queue_family(&families), Some(2));
    }

    #[test]
    fn test_queue_family_falls_back_to_compute_only() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1),
        ];
        assert_eq!(select_queue_family(&families), Some(1));
    }

    #[test]
    fn test_queue_family_ignores_empty_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 0),
            family(vk::QueueFlags::TRANSFER, 1),
        ];
        assert_eq!(select_queue_family(&families), None);
    }

    #[test]
    fn test_discrete_gpu_is_preferred() {
        let types = [
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ];
        assert_eq!(pick_device_index(&types, true), Some(1));
        assert_eq!(pick_device_index(&types, false), Some(0));
    }

    #[test]
    fn test_first_device_without_discrete() {
        let types = [vk::PhysicalDeviceType::CPU, vk::PhysicalDeviceType::INTEGRATED_GPU];
        assert_eq!(pick_device_index(&types, true), Some(0));
        assert_eq!(pick_device_index(&[], true), None);
    }

    #[test]
    fn test_error_messages_name_the_problem() {
        let error = VulkanError::UnsupportedLayoutTransition {
            from: ImageLayout::Undefined,
            to: ImageLayout::General,
        };
        assert_eq!(
            error.to_string(),
            "Unsupported layout transition: Undefined -> General"
        );

        let error = VulkanError::RegionOutOfBounds {
            offset: 8,
            len: 16,
            capacity: 20,
        };
        assert!(error.to_string().contains("exceeds region of 20 bytes"));
    }
}
