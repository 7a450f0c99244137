//! Headless Vulkan setup: instance, device, one compute-capable queue and the allocators
//! the builder needs.

use std::sync::Arc;

use log::info;
use vulkano::{
    command_buffer::allocator::StandardCommandBufferAllocator,
    descriptor_set::allocator::StandardDescriptorSetAllocator,
    device::{
        physical::PhysicalDeviceType, Device, DeviceCreateInfo, DeviceExtensions, Features,
        Queue, QueueCreateInfo, QueueFlags,
    },
    instance::{Instance, InstanceCreateFlags, InstanceCreateInfo},
    memory::allocator::{MemoryAllocator, StandardMemoryAllocator},
    VulkanLibrary,
};

use super::accel::device::VulkanoDevice;
use crate::error::BuildError;

pub struct RenderContext {
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
    pub memory_allocator: Arc<StandardMemoryAllocator>,
    pub command_buffer_allocator: Arc<StandardCommandBufferAllocator>,
    pub descriptor_set_allocator: Arc<StandardDescriptorSetAllocator>,
}

fn device_error(e: impl std::fmt::Display) -> BuildError {
    BuildError::Device(e.to_string())
}

impl RenderContext {
    /// Picks the best physical device that can build acceleration structures, preferring
    /// discrete GPUs.
    pub fn new() -> Result<RenderContext, BuildError> {
        let library = VulkanLibrary::new().map_err(device_error)?;
        let instance = Instance::new(
            library,
            InstanceCreateInfo {
                flags: InstanceCreateFlags::ENUMERATE_PORTABILITY,
                ..Default::default()
            },
        )
        .map_err(device_error)?;

        let device_extensions = DeviceExtensions {
            khr_acceleration_structure: true,
            khr_deferred_host_operations: true,
            ..DeviceExtensions::empty()
        };
        let features = Features {
            acceleration_structure: true,
            buffer_device_address: true,
            ..Features::empty()
        };

        let (physical_device, queue_family_index) = instance
            .enumerate_physical_devices()
            .map_err(device_error)?
            .filter(|p| p.supported_extensions().contains(&device_extensions))
            .filter(|p| p.supported_features().contains(&features))
            .filter_map(|p| {
                p.queue_family_properties()
                    .iter()
                    .position(|q| q.queue_flags.intersects(QueueFlags::COMPUTE))
                    .map(|i| (p, i as u32))
            })
            .min_by_key(|(p, _)| match p.properties().device_type {
                PhysicalDeviceType::DiscreteGpu => 0,
                PhysicalDeviceType::IntegratedGpu => 1,
                PhysicalDeviceType::VirtualGpu => 2,
                PhysicalDeviceType::Cpu => 3,
                PhysicalDeviceType::Other => 4,
                _ => 5,
            })
            .ok_or_else(|| device_error("no device supports acceleration structures"))?;

        info!(
            "using device: {} (type: {:?})",
            physical_device.properties().device_name,
            physical_device.properties().device_type
        );

        let (device, mut queues) = Device::new(
            physical_device,
            DeviceCreateInfo {
                enabled_extensions: device_extensions,
                enabled_features: features,
                queue_create_infos: vec![QueueCreateInfo {
                    queue_family_index,
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .map_err(device_error)?;
        let queue = queues
            .next()
            .ok_or_else(|| device_error("device returned no queue"))?;

        let memory_allocator = Arc::new(StandardMemoryAllocator::new_default(device.clone()));
        let command_buffer_allocator = Arc::new(StandardCommandBufferAllocator::new(
            device.clone(),
            Default::default(),
        ));
        let descriptor_set_allocator = Arc::new(StandardDescriptorSetAllocator::new(
            device.clone(),
            Default::default(),
        ));

        Ok(RenderContext {
            device,
            queue,
            memory_allocator,
            command_buffer_allocator,
            descriptor_set_allocator,
        })
    }

    pub fn accel_device(&self, prefer_fast_trace: bool) -> VulkanoDevice {
        let memory_allocator: Arc<dyn MemoryAllocator> = self.memory_allocator.clone();
        VulkanoDevice::new(
            self.queue.clone(),
            memory_allocator,
            self.command_buffer_allocator.clone(),
            prefer_fast_trace,
        )
    }
}
