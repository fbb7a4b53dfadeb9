// Shader module loading
//
// Shaders arrive as precompiled SPIR-V files. A missing file and a
// malformed file are distinct errors; both are fatal for pipeline creation.

use ash::vk;
use std::io::{self, Cursor};
use std::path::Path;

use crate::error::{GpuError, Result};

/// Read a file's bytes; `ShaderNotFound` if it does not exist.
pub fn load_binary(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => GpuError::ShaderNotFound(path.to_path_buf()),
        _ => GpuError::Io(e),
    })
}

/// Validate and realign SPIR-V bytecode into words.
pub fn decode_spirv(path: &Path, bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|source| GpuError::InvalidShader {
        path: path.to_path_buf(),
        source,
    })
}

/// Load SPIR-V from `path` and create a shader module
pub fn load_shader_module(device: &ash::Device, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = load_binary(path)?;
    let code = decode_spirv(path, &bytes)?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
    let module = unsafe { device.create_shader_module(&create_info, None) }?;
    log::debug!("Loaded shader {} ({} bytes)", path.display(), bytes.len());
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn missing_file_is_shader_not_found() {
        let path = Path::new("definitely/not/here.spv");
        match load_binary(path) {
            Err(GpuError::ShaderNotFound(p)) => assert_eq!(p, path),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn truncated_bytecode_is_rejected() {
        let bytes = [0x03, 0x02, 0x23];
        let err = decode_spirv(Path::new("bad.spv"), &bytes).unwrap_err();
        assert!(matches!(err, GpuError::InvalidShader { .. }));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let bytes = 0xdead_beef_u32.to_le_bytes();
        assert!(decode_spirv(Path::new("bad.spv"), &bytes).is_err());
    }

    #[test]
    fn valid_header_decodes_to_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000_u32.to_le_bytes());
        let words = decode_spirv(Path::new("ok.spv"), &bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }
}
