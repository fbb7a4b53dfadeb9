// Dependency declarations and their validator
//
// Plain data describing what the renderer needs from the hardware.
// Validation is pure data-shape checking and runs once, before the
// Vulkan library is even loaded.

use ash::vk;
use thiserror::Error;

use crate::error::{GpuError, Result};

/// What a queue is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Render passes; also the queue that presents.
    Graphics,
    /// Staging uploads and read-backs.
    Transfer,
    Compute,
}

/// One queue-family requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRequirement {
    pub role: QueueRole,
    /// Number of queues the role wants from its family.
    pub count: u32,
    /// Operations the family must support.
    pub operations: vk::QueueFlags,
    /// One priority in `[0, 1]` per requested queue.
    pub priorities: Vec<f32>,
    /// The family must be able to present to the window surface.
    pub present: bool,
}

/// Device-type preference with an optional fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePreference {
    pub preferred: vk::PhysicalDeviceType,
    pub fallback: Option<vk::PhysicalDeviceType>,
}

impl DevicePreference {
    /// Types in the order they should be tried.
    pub fn ordered(&self) -> Vec<vk::PhysicalDeviceType> {
        let mut types = vec![self.preferred];
        if let Some(fallback) = self.fallback {
            if fallback != self.preferred {
                types.push(fallback);
            }
        }
        types
    }
}

/// Swapchain negotiation inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainRequirement {
    pub image_count: u32,
    /// Ordered surface-format candidates, best first.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Usage bits the presentable images need; combined with OR.
    pub usages: Vec<vk::ImageUsageFlags>,
    /// Ordered present-mode candidates, best first.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainRequirement {
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usages
            .iter()
            .fold(vk::ImageUsageFlags::empty(), |acc, usage| acc | *usage)
    }
}

/// Format candidates that must support a feature set under a tiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRequirement {
    pub candidates: Vec<vk::Format>,
    pub tiling: vk::ImageTiling,
    pub features: vk::FormatFeatureFlags,
}

/// Everything the renderer declares before touching the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirements {
    /// Minimum instance/device API version (`vk::make_api_version`).
    pub api_version: u32,
    pub device: DevicePreference,
    pub queues: Vec<QueueRequirement>,
    pub swapchain: SwapchainRequirement,
    pub depth: FormatRequirement,
    /// Features the offscreen render target format must carry.
    pub render_target_features: vk::FormatFeatureFlags,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            api_version: vk::API_VERSION_1_1,
            device: DevicePreference {
                preferred: vk::PhysicalDeviceType::DISCRETE_GPU,
                fallback: Some(vk::PhysicalDeviceType::INTEGRATED_GPU),
            },
            queues: vec![
                QueueRequirement {
                    role: QueueRole::Graphics,
                    count: 1,
                    operations: vk::QueueFlags::GRAPHICS,
                    priorities: vec![1.0],
                    present: true,
                },
                QueueRequirement {
                    role: QueueRole::Transfer,
                    count: 1,
                    operations: vk::QueueFlags::TRANSFER,
                    priorities: vec![0.5],
                    present: false,
                },
            ],
            swapchain: SwapchainRequirement {
                image_count: 3,
                formats: vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::R8G8B8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                ],
                usages: vec![vk::ImageUsageFlags::TRANSFER_DST],
                present_modes: vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
            },
            depth: FormatRequirement {
                candidates: vec![
                    vk::Format::D32_SFLOAT,
                    vk::Format::D32_SFLOAT_S8_UINT,
                    vk::Format::D24_UNORM_S8_UINT,
                ],
                tiling: vk::ImageTiling::OPTIMAL,
                features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            },
            render_target_features: vk::FormatFeatureFlags::COLOR_ATTACHMENT
                | vk::FormatFeatureFlags::TRANSFER_SRC,
        }
    }
}

/// A single reason a declaration was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequirementIssue {
    #[error("API version is zero")]
    ZeroApiVersion,
    #[error("no queue requirements declared")]
    NoQueues,
    #[error("no graphics queue requirement declared")]
    MissingGraphicsQueue,
    #[error("queue role {0:?} declared more than once")]
    DuplicateRole(QueueRole),
    #[error("{0:?} queue requests zero queues")]
    ZeroQueueCount(QueueRole),
    #[error("{0:?} queue lists no supported operations")]
    NoQueueOperations(QueueRole),
    #[error("{role:?} queue requests {requested} queues but lists {provided} priorities")]
    MissingPriorities {
        role: QueueRole,
        requested: u32,
        provided: usize,
    },
    #[error("{role:?} queue priority {value} is outside [0, 1]")]
    PriorityOutOfRange { role: QueueRole, value: f32 },
    #[error("swapchain needs at least 2 images, {0} requested")]
    TooFewSwapchainImages(u32),
    #[error("{0} candidate list is empty")]
    EmptyCandidates(&'static str),
    #[error("{0} candidate list contains an undefined entry")]
    UndefinedCandidate(&'static str),
    #[error("{0} feature set is empty")]
    EmptyFeatures(&'static str),
}

impl Requirements {
    /// Every problem with this declaration, in declaration order.
    pub fn issues(&self) -> Vec<RequirementIssue> {
        let mut issues = Vec::new();

        if self.api_version == 0 {
            issues.push(RequirementIssue::ZeroApiVersion);
        }

        if self.queues.is_empty() {
            issues.push(RequirementIssue::NoQueues);
        } else if !self.queues.iter().any(|q| q.role == QueueRole::Graphics) {
            issues.push(RequirementIssue::MissingGraphicsQueue);
        }

        for (i, queue) in self.queues.iter().enumerate() {
            if self.queues[..i].iter().any(|earlier| earlier.role == queue.role) {
                issues.push(RequirementIssue::DuplicateRole(queue.role));
            }
            check_queue(queue, &mut issues);
        }

        let swapchain = &self.swapchain;
        if swapchain.image_count < 2 {
            issues.push(RequirementIssue::TooFewSwapchainImages(
                swapchain.image_count,
            ));
        }
        check_list(
            "surface format",
            &swapchain.formats,
            |f| f.format == vk::Format::UNDEFINED,
            &mut issues,
        );
        check_list(
            "swapchain usage",
            &swapchain.usages,
            |u| u.is_empty(),
            &mut issues,
        );
        check_list(
            "present mode",
            &swapchain.present_modes,
            |_| false,
            &mut issues,
        );

        check_list(
            "depth format",
            &self.depth.candidates,
            |f| *f == vk::Format::UNDEFINED,
            &mut issues,
        );
        if self.depth.features.is_empty() {
            issues.push(RequirementIssue::EmptyFeatures("depth format"));
        }
        if self.render_target_features.is_empty() {
            issues.push(RequirementIssue::EmptyFeatures("render target format"));
        }

        issues
    }

    pub fn is_valid(&self) -> bool {
        self.issues().is_empty()
    }

    /// Fails with every issue found; the caller must not create a device.
    pub fn validate(&self) -> Result<()> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            for issue in &issues {
                log::error!("Requirement rejected: {}", issue);
            }
            Err(GpuError::InvalidRequirements(issues))
        }
    }

    pub fn queue(&self, role: QueueRole) -> Option<&QueueRequirement> {
        self.queues.iter().find(|q| q.role == role)
    }
}

fn check_queue(queue: &QueueRequirement, issues: &mut Vec<RequirementIssue>) {
    if queue.count == 0 {
        issues.push(RequirementIssue::ZeroQueueCount(queue.role));
    }
    if queue.operations.is_empty() {
        issues.push(RequirementIssue::NoQueueOperations(queue.role));
    }
    if queue.priorities.len() < queue.count as usize {
        issues.push(RequirementIssue::MissingPriorities {
            role: queue.role,
            requested: queue.count,
            provided: queue.priorities.len(),
        });
    }
    // NaN fails the range check as well
    for &value in &queue.priorities {
        if !(0.0..=1.0).contains(&value) {
            issues.push(RequirementIssue::PriorityOutOfRange {
                role: queue.role,
                value,
            });
        }
    }
}

fn check_list<T>(
    what: &'static str,
    items: &[T],
    is_undefined: impl Fn(&T) -> bool,
    issues: &mut Vec<RequirementIssue>,
) {
    if items.is_empty() {
        issues.push(RequirementIssue::EmptyCandidates(what));
    } else if items.iter().any(is_undefined) {
        issues.push(RequirementIssue::UndefinedCandidate(what));
    }
}
