// Device/queue negotiation
//
// Works on snapshots of what the driver reports so the selection rules
// stay independent of a live instance. The first device (in type
// preference order) whose queue families satisfy every requirement wins.

use ash::vk;
use std::collections::BTreeMap;
use std::ffi::CStr;

use crate::error::{GpuError, Result};
use crate::requirements::{QueueRole, Requirements};

/// Everything the negotiator needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Per family: can it present to the target surface.
    pub present_support: Vec<bool>,
    pub supports_swapchain: bool,
}

impl DeviceCandidate {
    /// Snapshot a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(
        instance: &ash::Instance,
        handle: vk::PhysicalDevice,
        mut supports_present: impl FnMut(u32) -> Result<bool>,
    ) -> Result<Self> {
        let properties = instance.get_physical_device_properties(handle);
        let queue_families = instance.get_physical_device_queue_family_properties(handle);
        let present_support = (0..queue_families.len() as u32)
            .map(&mut supports_present)
            .collect::<Result<Vec<_>>>()?;

        let swapchain_name = ash::extensions::khr::Swapchain::name();
        let supports_swapchain = instance
            .enumerate_device_extension_properties(handle)?
            .iter()
            .any(|ext| CStr::from_ptr(ext.extension_name.as_ptr()) == swapchain_name);

        Ok(Self {
            handle,
            name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            device_type: properties.device_type,
            api_version: properties.api_version,
            queue_families,
            present_support,
            supports_swapchain,
        })
    }
}

/// Where a role's queues live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAssignment {
    pub role: QueueRole,
    pub family: u32,
    /// First queue index inside the family.
    pub index: u32,
    pub count: u32,
}

/// Queues to request from one family at device creation.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyRequest {
    pub family: u32,
    pub priorities: Vec<f32>,
}

/// Result of a successful negotiation.
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub device: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub assignments: Vec<QueueAssignment>,
    family_requests: Vec<FamilyRequest>,
}

impl DeviceSelection {
    pub fn assignment(&self, role: QueueRole) -> Option<&QueueAssignment> {
        self.assignments.iter().find(|a| a.role == role)
    }

    /// One entry per distinct family, with counts summed over the roles
    /// mapped to it (aliased queues are requested once).
    pub fn family_requests(&self) -> &[FamilyRequest] {
        &self.family_requests
    }
}

/// Pick a device and assign queue families for every declared role.
pub fn select_device(
    candidates: &[DeviceCandidate],
    requirements: &Requirements,
) -> Result<DeviceSelection> {
    let needs_present = requirements.queues.iter().any(|q| q.present);

    for device_type in requirements.device.ordered() {
        for candidate in candidates.iter().filter(|c| c.device_type == device_type) {
            if candidate.api_version < requirements.api_version {
                log::debug!("Skipping {}: API version too old", candidate.name);
                continue;
            }
            if needs_present && !candidate.supports_swapchain {
                log::debug!("Skipping {}: no swapchain extension", candidate.name);
                continue;
            }
            match assign_queues(candidate, requirements) {
                Some((assignments, family_requests)) => {
                    log::info!(
                        "Selected {} ({:?})",
                        candidate.name,
                        candidate.device_type
                    );
                    return Ok(DeviceSelection {
                        device: candidate.handle,
                        name: candidate.name.clone(),
                        device_type: candidate.device_type,
                        assignments,
                        family_requests,
                    });
                }
                None => log::debug!("Skipping {}: queue requirements unmet", candidate.name),
            }
        }
    }

    Err(GpuError::NoSuitableDevice)
}

fn assign_queues(
    candidate: &DeviceCandidate,
    requirements: &Requirements,
) -> Option<(Vec<QueueAssignment>, Vec<FamilyRequest>)> {
    // family -> priorities of the queues handed out so far
    let mut taken: BTreeMap<u32, Vec<f32>> = BTreeMap::new();
    let mut assignments = Vec::with_capacity(requirements.queues.len());

    for req in &requirements.queues {
        let (family, available) = candidate
            .queue_families
            .iter()
            .enumerate()
            .find(|(i, props)| {
                props.queue_flags.contains(req.operations)
                    && props.queue_count >= req.count
                    && (!req.present || candidate.present_support.get(*i).copied().unwrap_or(false))
            })
            .map(|(i, props)| (i as u32, props.queue_count))?;

        let used = taken.entry(family).or_default();
        let already = used.len() as u32;
        // Distinct queues while the family has room, otherwise alias the tail
        let index = already.min(available - req.count);
        for offset in 0..req.count {
            if index + offset >= already {
                used.push(*req.priorities.get(offset as usize)?);
            }
        }

        assignments.push(QueueAssignment {
            role: req.role,
            family,
            index,
            count: req.count,
        });
    }

    let family_requests = taken
        .into_iter()
        .map(|(family, priorities)| FamilyRequest { family, priorities })
        .collect();

    Some((assignments, family_requests))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    fn candidate(
        raw: u64,
        device_type: vk::PhysicalDeviceType,
        families: Vec<vk::QueueFamilyProperties>,
    ) -> DeviceCandidate {
        let present_support = vec![true; families.len()];
        DeviceCandidate {
            handle: vk::PhysicalDevice::from_raw(raw),
            name: format!("gpu-{raw}"),
            device_type,
            api_version: vk::API_VERSION_1_3,
            queue_families: families,
            present_support,
            supports_swapchain: true,
        }
    }

    fn graphics_transfer() -> vk::QueueFlags {
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER
    }

    #[test]
    fn prefers_discrete_over_integrated() {
        let integrated = candidate(
            1,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vec![family(graphics_transfer(), 1)],
        );
        let discrete = candidate(
            2,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![family(graphics_transfer(), 1)],
        );

        let selection =
            select_device(&[integrated, discrete], &Requirements::default()).unwrap();
        assert_eq!(selection.device, vk::PhysicalDevice::from_raw(2));
        assert_eq!(selection.device_type, vk::PhysicalDeviceType::DISCRETE_GPU);
    }

    #[test]
    fn falls_back_to_integrated() {
        let cpu = candidate(
            1,
            vk::PhysicalDeviceType::CPU,
            vec![family(graphics_transfer(), 4)],
        );
        let integrated = candidate(
            2,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vec![family(graphics_transfer(), 1)],
        );

        let selection = select_device(&[cpu, integrated], &Requirements::default()).unwrap();
        assert_eq!(selection.device, vk::PhysicalDevice::from_raw(2));
    }

    #[test]
    fn rejects_types_outside_preference() {
        let cpu = candidate(
            1,
            vk::PhysicalDeviceType::CPU,
            vec![family(graphics_transfer(), 4)],
        );
        let err = select_device(&[cpu], &Requirements::default()).unwrap_err();
        assert!(matches!(err, GpuError::NoSuitableDevice));
    }

    #[test]
    fn shared_family_with_two_queues_gets_distinct_indices() {
        let gpu = candidate(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![family(graphics_transfer(), 2)],
        );

        let selection = select_device(&[gpu], &Requirements::default()).unwrap();
        let graphics = selection.assignment(QueueRole::Graphics).unwrap();
        let transfer = selection.assignment(QueueRole::Transfer).unwrap();
        assert_eq!(graphics.family, transfer.family);
        assert_eq!(graphics.index, 0);
        assert_eq!(transfer.index, 1);

        assert_eq!(
            selection.family_requests(),
            &[FamilyRequest {
                family: 0,
                priorities: vec![1.0, 0.5],
            }]
        );
    }

    #[test]
    fn shared_family_with_one_queue_aliases() {
        let gpu = candidate(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![family(graphics_transfer(), 1)],
        );

        let selection = select_device(&[gpu], &Requirements::default()).unwrap();
        let graphics = selection.assignment(QueueRole::Graphics).unwrap();
        let transfer = selection.assignment(QueueRole::Transfer).unwrap();
        assert_eq!(graphics.index, 0);
        assert_eq!(transfer.index, 0);
        assert_eq!(selection.family_requests()[0].priorities, vec![1.0]);
    }

    #[test]
    fn graphics_family_must_present() {
        let mut gpu = candidate(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![
                family(graphics_transfer(), 1),
                family(graphics_transfer(), 1),
            ],
        );
        gpu.present_support = vec![false, true];

        let selection = select_device(&[gpu], &Requirements::default()).unwrap();
        assert_eq!(selection.assignment(QueueRole::Graphics).unwrap().family, 1);
        // Transfer has no present requirement and takes the first match
        assert_eq!(selection.assignment(QueueRole::Transfer).unwrap().family, 0);
        assert_eq!(selection.family_requests().len(), 2);
    }

    #[test]
    fn no_present_support_means_no_device() {
        let mut gpu = candidate(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![family(graphics_transfer(), 1)],
        );
        gpu.present_support = vec![false];

        assert!(matches!(
            select_device(&[gpu], &Requirements::default()),
            Err(GpuError::NoSuitableDevice)
        ));
    }

    #[test]
    fn old_api_version_is_skipped() {
        let mut old = candidate(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![family(graphics_transfer(), 1)],
        );
        old.api_version = vk::API_VERSION_1_0;
        let newer = candidate(
            2,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vec![family(graphics_transfer(), 1)],
        );

        let selection = select_device(&[old, newer], &Requirements::default()).unwrap();
        assert_eq!(selection.device, vk::PhysicalDevice::from_raw(2));
    }

    #[test]
    fn dedicated_transfer_family_is_not_required() {
        let gpu = candidate(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![
                family(vk::QueueFlags::COMPUTE, 1),
                family(graphics_transfer(), 1),
            ],
        );

        let selection = select_device(&[gpu], &Requirements::default()).unwrap();
        assert_eq!(selection.assignment(QueueRole::Graphics).unwrap().family, 1);
        assert_eq!(selection.assignment(QueueRole::Transfer).unwrap().family, 1);
    }

    #[test]
    fn short_priority_list_rejects_candidate_instead_of_panicking() {
        let gpu = candidate(
            1,
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vec![family(graphics_transfer(), 2)],
        );
        let mut reqs = Requirements::default();
        reqs.queues[0].count = 2;
        reqs.queues[0].priorities = vec![1.0];
        assert!(!reqs.is_valid());

        let err = select_device(&[gpu], &reqs).unwrap_err();
        assert!(matches!(err, GpuError::NoSuitableDevice));
    }
}
