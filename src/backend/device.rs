// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Physical device negotiation against declared requirements
// - Logical device + queue creation
// - Cached memory/format properties for the resource layer

use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;

use super::memory;
use super::negotiator::{self, DeviceCandidate, DeviceSelection};
use super::surface::{PresentSurface, SurfaceProvider};
use crate::error::{GpuError, Result};
use crate::requirements::{QueueRole, Requirements};

/// A retrieved device queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceQueue {
    pub role: QueueRole,
    pub family: u32,
    pub index: u32,
    pub handle: vk::Queue,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    queues: QueueTable,

    surface: Option<PresentSurface>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub name: String,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

/// Instance-level objects that must be torn down if device creation fails.
struct InstanceParts {
    entry: Entry,
    instance: ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface: Option<PresentSurface>,
}

impl InstanceParts {
    unsafe fn destroy(self) {
        if let Some(surface) = &self.surface {
            surface.destroy();
        }
        if let Some((debug_utils, messenger)) = &self.debug_utils {
            debug_utils.destroy_debug_utils_messenger(*messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

impl VulkanDevice {
    /// Create a device able to present to `window`.
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `requirements` - Validated before anything is loaded
    /// * `enable_validation` - Enable Vulkan validation layers
    pub fn new(
        app_name: &str,
        requirements: &Requirements,
        enable_validation: bool,
        window: &dyn SurfaceProvider,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);
        requirements.validate()?;

        if !window.supports_vulkan() {
            log::error!("Windowing backend cannot present with Vulkan");
            return Err(GpuError::SurfaceUnsupported);
        }

        let extensions = window.required_extensions()?;
        let mut parts = Self::create_instance_parts(app_name, requirements, enable_validation, extensions)?;

        let surface_handle = match unsafe { window.create_surface(&parts.entry, &parts.instance) } {
            Ok(handle) => handle,
            Err(e) => {
                unsafe { parts.destroy() };
                return Err(e);
            }
        };
        parts.surface = Some(PresentSurface {
            loader: ash::extensions::khr::Surface::new(&parts.entry, &parts.instance),
            handle: surface_handle,
        });

        Self::finish(parts, requirements)
    }

    /// Create a device without a surface (tools and tests).
    pub fn headless(app_name: &str, requirements: &Requirements) -> Result<Arc<Self>> {
        log::info!("Creating headless Vulkan device: {}", app_name);
        requirements.validate()?;

        let mut requirements = requirements.clone();
        for queue in &mut requirements.queues {
            queue.present = false;
        }

        let parts = Self::create_instance_parts(app_name, &requirements, false, Vec::new())?;
        Self::finish(parts, &requirements)
    }

    fn create_instance_parts(
        app_name: &str,
        requirements: &Requirements,
        enable_validation: bool,
        mut extensions: Vec<*const c_char>,
    ) -> Result<InstanceParts> {
        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }.map_err(|e| {
            log::error!("Failed to load Vulkan library. Is Vulkan installed?");
            GpuError::LoaderUnavailable(e.to_string())
        })?;

        // Step 2: Check the loader offers the requested version
        let available = entry
            .try_enumerate_instance_version()?
            .unwrap_or(vk::API_VERSION_1_0);
        if available < requirements.api_version {
            log::error!("Vulkan loader version too old");
            return Err(GpuError::UnsupportedApiVersion {
                required: format_version(requirements.api_version),
                available: format_version(available),
            });
        }

        // Step 3: Create instance
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }
        let instance =
            Self::create_instance(&entry, app_name, requirements.api_version, enable_validation, &extensions)?;

        // Step 4: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(InstanceParts {
            entry,
            instance,
            debug_utils,
            surface: None,
        })
    }

    fn finish(parts: InstanceParts, requirements: &Requirements) -> Result<Arc<Self>> {
        match Self::negotiate_and_create(&parts, requirements) {
            Ok((selection, device)) => {
                let physical_device = selection.device;
                let properties = unsafe { parts.instance.get_physical_device_properties(physical_device) };
                let memory_properties = unsafe {
                    parts
                        .instance
                        .get_physical_device_memory_properties(physical_device)
                };

                let roles = selection
                    .assignments
                    .iter()
                    .map(|assignment| DeviceQueue {
                        role: assignment.role,
                        family: assignment.family,
                        index: assignment.index,
                        handle: unsafe {
                            device.get_device_queue(assignment.family, assignment.index)
                        },
                    })
                    .collect();
                let queues = match QueueTable::new(roles) {
                    Ok(queues) => queues,
                    Err(e) => {
                        unsafe {
                            device.destroy_device(None);
                            parts.destroy();
                        }
                        return Err(e);
                    }
                };

                log::info!("Selected GPU: {}", selection.name);
                log::info!(
                    "API Version: {}",
                    format_version(properties.api_version)
                );
                for queue in &queues.roles {
                    log::debug!(
                        "{:?} queue: family {} index {}",
                        queue.role,
                        queue.family,
                        queue.index
                    );
                }

                let InstanceParts {
                    entry,
                    instance,
                    debug_utils,
                    surface,
                } = parts;

                Ok(Arc::new(Self {
                    device,
                    physical_device,
                    instance,
                    _entry: entry,
                    queues,
                    surface,
                    debug_utils,
                    name: selection.name,
                    properties,
                    memory_properties,
                }))
            }
            Err(e) => {
                log::error!("Device negotiation failed: {}", e);
                unsafe { parts.destroy() };
                Err(e)
            }
        }
    }

    fn negotiate_and_create(
        parts: &InstanceParts,
        requirements: &Requirements,
    ) -> Result<(DeviceSelection, ash::Device)> {
        let devices = unsafe { parts.instance.enumerate_physical_devices() }?;
        if devices.is_empty() {
            return Err(GpuError::NoSuitableDevice);
        }

        let candidates = devices
            .into_iter()
            .map(|physical_device| unsafe {
                DeviceCandidate::query(&parts.instance, physical_device, |family| {
                    match &parts.surface {
                        Some(surface) => surface.supports_family(physical_device, family),
                        None => Ok(true),
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let selection = negotiator::select_device(&candidates, requirements)?;
        let device = Self::create_logical_device(
            &parts.instance,
            &selection,
            parts.surface.is_some(),
        )?;
        Ok((selection, device))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        api_version: u32,
        enable_validation: bool,
        extensions: &[*const c_char],
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)
            .map_err(|_| GpuError::InvalidConfig("application name contains NUL".into()))?;
        let engine_name = c"vkframe";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

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

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        selection: &DeviceSelection,
        with_swapchain: bool,
    ) -> Result<ash::Device> {
        // One create-info per distinct family
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = selection
            .family_requests()
            .iter()
            .map(|request| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(request.family)
                    .queue_priorities(&request.priorities)
                    .build()
            })
            .collect();

        let extensions = if with_swapchain {
            vec![ash::extensions::khr::Swapchain::name().as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(selection.device, &create_info, None) }?;
        Ok(device)
    }

    /// The queue assigned to `role`, if that role was declared.
    pub fn queue(&self, role: QueueRole) -> Option<DeviceQueue> {
        self.queues.get(role)
    }

    pub fn graphics_queue(&self) -> DeviceQueue {
        self.queues.graphics
    }

    /// The transfer queue, or the graphics queue when no transfer role
    /// was declared.
    pub fn transfer_queue(&self) -> DeviceQueue {
        self.queues.get_or_graphics(QueueRole::Transfer)
    }

    /// Distinct queue families in use, sorted.
    pub fn queue_families(&self) -> Vec<u32> {
        self.queues.families()
    }

    pub fn surface(&self) -> Option<&PresentSurface> {
        self.surface.as_ref()
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        memory::find_memory_type(&self.memory_properties, type_bits, flags)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Queues handed out per role. Validated requirements always declare a
/// graphics role, so the graphics queue is resolved once up front.
#[derive(Debug, Clone)]
struct QueueTable {
    roles: Vec<DeviceQueue>,
    graphics: DeviceQueue,
}

impl QueueTable {
    fn new(roles: Vec<DeviceQueue>) -> Result<Self> {
        let graphics = roles
            .iter()
            .find(|q| q.role == QueueRole::Graphics)
            .copied()
            .ok_or_else(|| GpuError::InvalidState("no graphics queue was assigned".into()))?;
        Ok(Self { roles, graphics })
    }

    fn get(&self, role: QueueRole) -> Option<DeviceQueue> {
        self.roles.iter().find(|q| q.role == role).copied()
    }

    fn get_or_graphics(&self, role: QueueRole) -> DeviceQueue {
        self.get(role).unwrap_or(self.graphics)
    }

    fn families(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.roles.iter().map(|q| q.family).collect();
        families.sort_unstable();
        families.dedup();
        families
    }
}

fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
