// Depth and render-target image lifecycle against a real device. Machines
// without a Vulkan driver skip these.

use ash::vk;
use std::sync::Arc;
use vkframe::backend::image::{ImageKind, ImageResource, ImageSpec};
use vkframe::backend::memory::select_supported_format;
use vkframe::backend::pipeline::RenderPass;
use vkframe::{GpuError, Requirements, VulkanDevice};

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 64,
    height: 48,
};
const COLOR: vk::Format = vk::Format::R8G8B8A8_UNORM;

fn device() -> Option<Arc<VulkanDevice>> {
    match VulkanDevice::headless("vkframe-tests", &Requirements::default()) {
        Ok(device) => Some(device),
        Err(e) => {
            eprintln!("skipping: no usable Vulkan device ({e})");
            None
        }
    }
}

fn depth_format(device: &VulkanDevice) -> vk::Format {
    let depth = Requirements::default().depth;
    select_supported_format(&depth.candidates, depth.tiling, depth.features, |format| {
        device.format_properties(format)
    })
    .unwrap()
}

fn render_target_spec() -> ImageSpec {
    ImageSpec::render_target(COLOR, EXTENT, Requirements::default().render_target_features)
}

#[test]
fn render_target_attaches_live_depth_only() {
    let Some(device) = device() else { return };
    let depth_format = depth_format(&device);
    let render_pass = RenderPass::new(&device, COLOR, depth_format).unwrap();

    let mut depth = ImageResource::create(&device, &ImageSpec::depth(depth_format, EXTENT)).unwrap();
    assert_eq!(depth.kind(), ImageKind::Depth);
    assert_eq!(depth.tiling(), vk::ImageTiling::OPTIMAL);
    assert!(depth.aspect().contains(vk::ImageAspectFlags::DEPTH));

    let mut target = ImageResource::create(&device, &render_target_spec()).unwrap();
    assert_eq!(target.aspect(), vk::ImageAspectFlags::COLOR);
    assert!(target.framebuffer().is_none());

    target.attach_framebuffer(render_pass.handle(), &depth).unwrap();
    assert!(target.framebuffer().is_some());

    // A render target is not a depth image
    let other = ImageResource::create(&device, &render_target_spec()).unwrap();
    assert!(matches!(
        target.attach_framebuffer(render_pass.handle(), &other),
        Err(GpuError::InvalidState(_))
    ));

    depth.close();
    assert!(matches!(
        target.attach_framebuffer(render_pass.handle(), &depth),
        Err(GpuError::InvalidState(_))
    ));
    // The earlier framebuffer survives a rejected attach
    assert!(target.framebuffer().is_some());
}

#[test]
fn depth_with_other_extent_is_rejected() {
    let Some(device) = device() else { return };
    let depth_format = depth_format(&device);
    let render_pass = RenderPass::new(&device, COLOR, depth_format).unwrap();

    let small = vk::Extent2D {
        width: 32,
        height: 32,
    };
    let depth = ImageResource::create(&device, &ImageSpec::depth(depth_format, small)).unwrap();
    let mut target = ImageResource::create(&device, &render_target_spec()).unwrap();
    assert!(target.attach_framebuffer(render_pass.handle(), &depth).is_err());
}

#[test]
fn close_is_idempotent_and_releases_framebuffer() {
    let Some(device) = device() else { return };
    let depth_format = depth_format(&device);
    let render_pass = RenderPass::new(&device, COLOR, depth_format).unwrap();

    let depth = ImageResource::create(&device, &ImageSpec::depth(depth_format, EXTENT)).unwrap();
    let mut target = ImageResource::create(&device, &render_target_spec()).unwrap();
    target.attach_framebuffer(render_pass.handle(), &depth).unwrap();

    target.close();
    assert!(target.is_closed());
    assert!(target.framebuffer().is_none());
    target.close();
    assert!(target.is_closed());

    // A closed image cannot get a new framebuffer
    assert!(target.attach_framebuffer(render_pass.handle(), &depth).is_err());
    // Drop after close must not destroy anything twice
    drop(target);
    device.wait_idle().unwrap();
}

#[test]
fn missing_linear_feature_fails_creation() {
    let Some(device) = device() else { return };

    // Depth formats are never color attachments, under any tiling
    let format = vk::Format::D32_SFLOAT;
    let linear = device.format_properties(format).linear_tiling_features;
    if linear.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT) {
        return;
    }

    let spec = ImageSpec {
        tiling: vk::ImageTiling::LINEAR,
        ..ImageSpec::render_target(format, EXTENT, vk::FormatFeatureFlags::COLOR_ATTACHMENT)
    };
    match ImageResource::create(&device, &spec) {
        Err(GpuError::UnsupportedFormatFeatures {
            format: rejected,
            tiling,
            missing,
        }) => {
            assert_eq!(rejected, format);
            assert_eq!(tiling, vk::ImageTiling::LINEAR);
            assert!(missing.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT));
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("image created without a required format feature"),
    }
}
