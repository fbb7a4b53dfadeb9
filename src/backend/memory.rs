// Memory-type and format-feature compatibility checks
//
// Pure functions over the property tables the device reports, so the
// rules can be exercised without a GPU.

use ash::vk;

use crate::error::{GpuError, Result};

/// First memory type whose bit is set in `type_bits` and whose
/// property flags are a superset of `flags`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            let has_type = type_bits & (1 << i) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(flags);
            has_type && has_properties
        })
        .ok_or(GpuError::NoMemoryType { type_bits, flags })
}

/// Feature flags a format exposes under the given tiling.
pub fn tiling_features(
    properties: &vk::FormatProperties,
    tiling: vk::ImageTiling,
) -> vk::FormatFeatureFlags {
    match tiling {
        vk::ImageTiling::LINEAR => properties.linear_tiling_features,
        vk::ImageTiling::OPTIMAL => properties.optimal_tiling_features,
        _ => vk::FormatFeatureFlags::empty(),
    }
}

/// Fails unless every flag in `required` is supported. A mismatch is
/// never downgraded to a fallback.
pub fn check_format_features(
    format: vk::Format,
    tiling: vk::ImageTiling,
    properties: &vk::FormatProperties,
    required: vk::FormatFeatureFlags,
) -> Result<()> {
    let supported = tiling_features(properties, tiling);
    let missing = required & !supported;
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GpuError::UnsupportedFormatFeatures {
            format,
            tiling,
            missing,
        })
    }
}

/// First candidate whose features under `tiling` contain `required`.
pub fn select_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    required: vk::FormatFeatureFlags,
    query: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Result<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| check_format_features(format, tiling, &query(format), required).is_ok())
        .ok_or(GpuError::NoSupportedFormat { required })
}

/// Image aspect implied by a format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_table(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        props
    }

    #[test]
    fn picks_first_type_with_superset_flags() {
        let table = memory_table(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let index = find_memory_type(
            &table,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn respects_type_filter_bits() {
        let table = memory_table(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        let index =
            find_memory_type(&table, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn missing_memory_type_is_an_error() {
        let table = memory_table(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let err =
            find_memory_type(&table, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(err, GpuError::NoMemoryType { type_bits: 1, .. }));
    }

    #[test]
    fn rejects_tiling_missing_a_required_feature() {
        // Listed as a color attachment under optimal tiling, but not linear
        let props = vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::TRANSFER_SRC,
            optimal_tiling_features: vk::FormatFeatureFlags::COLOR_ATTACHMENT
                | vk::FormatFeatureFlags::TRANSFER_SRC,
            buffer_features: vk::FormatFeatureFlags::empty(),
        };
        let required =
            vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::TRANSFER_SRC;

        assert!(check_format_features(
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageTiling::OPTIMAL,
            &props,
            required
        )
        .is_ok());

        let err = check_format_features(
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageTiling::LINEAR,
            &props,
            required,
        )
        .unwrap_err();
        match err {
            GpuError::UnsupportedFormatFeatures { missing, .. } => {
                assert_eq!(missing, vk::FormatFeatureFlags::COLOR_ATTACHMENT);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn selects_first_candidate_with_features() {
        let depth = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        let chosen = select_supported_format(
            &[vk::Format::D32_SFLOAT, vk::Format::D24_UNORM_S8_UINT],
            vk::ImageTiling::OPTIMAL,
            depth,
            |format| vk::FormatProperties {
                optimal_tiling_features: if format == vk::Format::D24_UNORM_S8_UINT {
                    depth
                } else {
                    vk::FormatFeatureFlags::empty()
                },
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(chosen, vk::Format::D24_UNORM_S8_UINT);
    }

    #[test]
    fn no_supported_candidate_is_an_error() {
        let err = select_supported_format(
            &[vk::Format::D32_SFLOAT],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| vk::FormatProperties::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GpuError::NoSupportedFormat { .. }));
    }

    #[test]
    fn aspect_follows_format_class() {
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_for_format(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
    }
}
