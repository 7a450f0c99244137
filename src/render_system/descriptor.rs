//! Publishes the root TLAS to shaders through a one-binding descriptor set.

use std::{collections::BTreeMap, sync::Arc};

use log::debug;
use vulkano::{
    acceleration_structure::AccelerationStructure,
    descriptor_set::{
        allocator::StandardDescriptorSetAllocator,
        layout::{
            DescriptorSetLayout, DescriptorSetLayoutBinding, DescriptorSetLayoutCreateInfo,
            DescriptorType,
        },
        PersistentDescriptorSet, WriteDescriptorSet,
    },
    device::Device,
    shader::ShaderStages,
};

use crate::error::BuildError;

/// Layout holding a single acceleration structure visible to the fragment stage.
pub struct RayDescriptor {
    binding: u32,
    layout: Arc<DescriptorSetLayout>,
    descriptor_set_allocator: Arc<StandardDescriptorSetAllocator>,
}

impl RayDescriptor {
    pub fn new(
        device: Arc<Device>,
        descriptor_set_allocator: Arc<StandardDescriptorSetAllocator>,
        binding: u32,
    ) -> Result<RayDescriptor, BuildError> {
        let layout = DescriptorSetLayout::new(
            device,
            DescriptorSetLayoutCreateInfo {
                bindings: BTreeMap::from([(
                    binding,
                    DescriptorSetLayoutBinding {
                        stages: ShaderStages::FRAGMENT,
                        ..DescriptorSetLayoutBinding::descriptor_type(
                            DescriptorType::AccelerationStructure,
                        )
                    },
                )]),
                ..Default::default()
            },
        )
        .map_err(|e| BuildError::Descriptor(e.to_string()))?;

        Ok(RayDescriptor {
            binding,
            layout,
            descriptor_set_allocator,
        })
    }

    pub fn binding(&self) -> u32 {
        self.binding
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    /// Writes `root` into a fresh descriptor set. Only call with a fully built structure.
    pub fn bind(
        &self,
        root: Arc<AccelerationStructure>,
    ) -> Result<Arc<PersistentDescriptorSet>, BuildError> {
        debug!("binding root TLAS at binding {}", self.binding);
        PersistentDescriptorSet::new(
            &self.descriptor_set_allocator,
            self.layout.clone(),
            [WriteDescriptorSet::acceleration_structure(self.binding, root)],
            [],
        )
        .map_err(|e| BuildError::Descriptor(e.to_string()))
    }
}
