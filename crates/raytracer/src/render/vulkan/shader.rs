//! Compute kernel loading
//!
//! SPIR-V module loading following RAII patterns. The module is only needed
//! while the pipeline is being built and is dropped right after.

use ash::{vk, Device};
use std::ffi::CStr;
use std::io::Cursor;
use std::path::Path;

use super::{VulkanError, VulkanResult};

/// Kernel entry point
pub const ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into words, fixing endianness and checking the magic number
pub fn parse_spirv(bytes: &[u8]) -> VulkanResult<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| VulkanError::InvalidSpirv(e.to_string()))?;

    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(VulkanError::InvalidSpirv(format!(
            "bad magic number {other:#010x}"
        ))),
        None => Err(VulkanError::InvalidSpirv("empty module".to_string())),
    }
}

/// Shader module wrapper with RAII cleanup
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create shader module from SPIR-V bytecode
    pub fn from_bytes(device: Device, bytes: &[u8]) -> VulkanResult<Self> {
        let code = parse_spirv(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module =
            unsafe { device.create_shader_module(&create_info, None) }.map_err(VulkanError::Api)?;

        Ok(Self { device, module })
    }

    /// Load shader from SPIR-V file
    pub fn from_file<P: AsRef<Path>>(device: Device, path: P) -> VulkanResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| VulkanError::ShaderLoad {
            path: path.to_path_buf(),
            source,
        })?;

        log::debug!("Loaded kernel {:?} ({} bytes)", path, bytes.len());
        Self::from_bytes(device, &bytes)
    }

    /// Get shader module handle
    pub const fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Compute stage info using the `main` entry point
    pub fn compute_stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.module)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_parse_valid_header() {
        let bytes = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0500, 0, 8, 0]);
        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_parse_swapped_endianness() {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 0x0001_0500]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        assert_eq!(parse_spirv(&bytes).unwrap()[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_rejects_truncated_module() {
        let mut bytes = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0500]);
        bytes.pop();
        assert!(matches!(parse_spirv(&bytes), Err(VulkanError::InvalidSpirv(_))));
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let bytes = words_to_bytes(&[0xDEAD_BEEF, 0]);
        assert!(matches!(parse_spirv(&bytes), Err(VulkanError::InvalidSpirv(_))));
        assert!(matches!(parse_spirv(&[]), Err(VulkanError::InvalidSpirv(_))));
    }
}
