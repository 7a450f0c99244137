//! Device side of an acceleration structure build: staging, size queries, allocation, the
//! build command itself and the blocking one-shot submission.

use std::{mem, sync::Arc};

use log::trace;
use vulkano::{
    acceleration_structure::{
        AccelerationStructure, AccelerationStructureBuildGeometryInfo,
        AccelerationStructureBuildRangeInfo, AccelerationStructureBuildSizesInfo,
        AccelerationStructureBuildType, AccelerationStructureCreateInfo,
        AccelerationStructureGeometries, AccelerationStructureGeometryInstancesData,
        AccelerationStructureGeometryInstancesDataType, AccelerationStructureGeometryTrianglesData,
        AccelerationStructureInstance, AccelerationStructureType, BuildAccelerationStructureFlags,
        BuildAccelerationStructureMode, GeometryFlags,
    },
    buffer::{Buffer, BufferContents, BufferCreateInfo, BufferUsage, IndexBuffer, Subbuffer},
    command_buffer::{
        allocator::StandardCommandBufferAllocator, AutoCommandBufferBuilder, CommandBufferUsage,
        PrimaryCommandBufferAbstract,
    },
    device::{DeviceOwned, Queue},
    format::Format,
    memory::allocator::{AllocationCreateInfo, MemoryAllocator, MemoryTypeFilter},
    sync::GpuFuture,
    DeviceSize,
};

use crate::{
    error::BuildError,
    render_system::{accel::compact::CompactedGeometry, vertex::PositionVertex},
    scene::NodeIndex,
};

/// The device-resource collaborator the builder drives.
///
/// Both build calls block until the device reports the structure complete, so a returned
/// structure can be instanced by the next build straight away. Failures are final.
pub trait AccelerationStructureDevice {
    type Structure: Clone;

    fn build_bottom_level(&mut self, geometry: &CompactedGeometry) -> Result<Self::Structure, BuildError>;

    fn build_top_level(
        &mut self,
        node: NodeIndex,
        instances: &[AccelerationStructureInstance],
    ) -> Result<Self::Structure, BuildError>;

    fn device_address(&self, structure: &Self::Structure) -> u64;
}

/// Host-visible upload buffer that lives for a single build call.
struct Staging<T: ?Sized> {
    node: NodeIndex,
    what: &'static str,
    buffer: Subbuffer<T>,
}

impl<T: BufferContents> Staging<[T]> {
    fn upload<I>(
        memory_allocator: Arc<dyn MemoryAllocator>,
        node: NodeIndex,
        what: &'static str,
        data: I,
    ) -> Result<Staging<[T]>, BuildError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let buffer = Buffer::from_iter(
            memory_allocator,
            BufferCreateInfo {
                usage: BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY
                    | BufferUsage::SHADER_DEVICE_ADDRESS,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE
                    | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            data,
        )
        .map_err(|e| BuildError::Allocation {
            node,
            what,
            message: e.to_string(),
        })?;
        trace!("node {}: staged {} ({} bytes)", node, what, buffer.size());
        Ok(Staging { node, what, buffer })
    }
}

impl<T: ?Sized> Drop for Staging<T> {
    fn drop(&mut self) {
        trace!("node {}: released {}", self.node, self.what);
    }
}

pub struct VulkanoDevice {
    queue: Arc<Queue>,
    memory_allocator: Arc<dyn MemoryAllocator>,
    command_buffer_allocator: Arc<StandardCommandBufferAllocator>,
    build_flags: BuildAccelerationStructureFlags,
}

impl VulkanoDevice {
    pub fn new(
        queue: Arc<Queue>,
        memory_allocator: Arc<dyn MemoryAllocator>,
        command_buffer_allocator: Arc<StandardCommandBufferAllocator>,
        prefer_fast_trace: bool,
    ) -> VulkanoDevice {
        VulkanoDevice {
            queue,
            memory_allocator,
            command_buffer_allocator,
            build_flags: if prefer_fast_trace {
                BuildAccelerationStructureFlags::PREFER_FAST_TRACE
            } else {
                BuildAccelerationStructureFlags::PREFER_FAST_BUILD
            },
        }
    }

    fn create_acceleration_structure(
        &self,
        node: NodeIndex,
        ty: AccelerationStructureType,
        size: DeviceSize,
    ) -> Result<Arc<AccelerationStructure>, BuildError> {
        let buffer = Buffer::new_slice::<u8>(
            self.memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE
                    | BufferUsage::SHADER_DEVICE_ADDRESS,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
                ..Default::default()
            },
            size,
        )
        .map_err(|e| BuildError::Allocation {
            node,
            what: "acceleration structure storage",
            message: e.to_string(),
        })?;

        unsafe {
            AccelerationStructure::new(
                self.memory_allocator.device().clone(),
                AccelerationStructureCreateInfo {
                    ty,
                    ..AccelerationStructureCreateInfo::new(buffer)
                },
            )
        }
        .map_err(|e| BuildError::Allocation {
            node,
            what: "acceleration structure",
            message: e.to_string(),
        })
    }

    fn create_scratch_buffer(&self, node: NodeIndex, size: DeviceSize) -> Result<Subbuffer<[u8]>, BuildError> {
        let alignment_requirement = self
            .memory_allocator
            .device()
            .physical_device()
            .properties()
            .min_acceleration_structure_scratch_offset_alignment
            .unwrap_or(1)
            .max(1) as DeviceSize;

        let allocation_error = |message: String| BuildError::Allocation {
            node,
            what: "scratch buffer",
            message,
        };

        let subbuffer = Buffer::new_slice::<u8>(
            self.memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::STORAGE_BUFFER | BufferUsage::SHADER_DEVICE_ADDRESS,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
                ..Default::default()
            },
            size + alignment_requirement,
        )
        .map_err(|e| allocation_error(e.to_string()))?;

        // get the next aligned offset
        let subbuffer_address: DeviceSize = subbuffer
            .device_address()
            .map_err(|e| allocation_error(e.to_string()))?
            .into();
        let aligned_offset =
            (alignment_requirement - subbuffer_address % alignment_requirement) % alignment_requirement;

        Ok(subbuffer.slice(aligned_offset..(aligned_offset + size)))
    }

    // query sizes, allocate, record, submit and wait
    fn build_acceleration_structure(
        &self,
        node: NodeIndex,
        ty: AccelerationStructureType,
        mut build_info: AccelerationStructureBuildGeometryInfo,
        primitive_count: u32,
    ) -> Result<Arc<AccelerationStructure>, BuildError> {
        let AccelerationStructureBuildSizesInfo {
            acceleration_structure_size,
            build_scratch_size,
            ..
        } = self
            .memory_allocator
            .device()
            .acceleration_structure_build_sizes(
                AccelerationStructureBuildType::Device,
                &build_info,
                &[primitive_count],
            )
            .map_err(|e| BuildError::SizeQuery {
                node,
                message: e.to_string(),
            })?;

        let acceleration_structure =
            self.create_acceleration_structure(node, ty, acceleration_structure_size)?;
        let scratch_buffer = self.create_scratch_buffer(node, build_scratch_size)?;

        build_info.dst_acceleration_structure = Some(acceleration_structure.clone());
        build_info.scratch_data = Some(scratch_buffer);

        let build_range_infos = [AccelerationStructureBuildRangeInfo {
            primitive_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        }];

        let record_error = |message: String| BuildError::Record { node, message };
        let mut builder = AutoCommandBufferBuilder::primary(
            self.command_buffer_allocator.as_ref(),
            self.queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )
        .map_err(|e| record_error(e.to_string()))?;

        // the builder tracks the structure as written here and inserts the barrier that
        // orders this write before any later read of it
        unsafe {
            builder
                .build_acceleration_structure(build_info, build_range_infos.into_iter().collect())
                .map_err(|e| record_error(e.to_string()))?;
        }

        let submission_error = |message: String| BuildError::Submission { node, message };
        builder
            .build()
            .map_err(|e| record_error(e.to_string()))?
            .execute(self.queue.clone())
            .map_err(|e| submission_error(e.to_string()))?
            .then_signal_fence_and_flush()
            .map_err(|e| submission_error(e.to_string()))?
            .wait(None)
            .map_err(|e| submission_error(e.to_string()))?;

        Ok(acceleration_structure)
    }
}

impl AccelerationStructureDevice for VulkanoDevice {
    type Structure = Arc<AccelerationStructure>;

    fn build_bottom_level(&mut self, geometry: &CompactedGeometry) -> Result<Self::Structure, BuildError> {
        let node = geometry.node;
        let vertices = Staging::upload(
            self.memory_allocator.clone(),
            node,
            "vertex staging buffer",
            geometry.positions.iter().copied(),
        )?;
        let indices = Staging::upload(
            self.memory_allocator.clone(),
            node,
            "index staging buffer",
            geometry.indices.iter().copied(),
        )?;

        let triangles = AccelerationStructureGeometryTrianglesData {
            flags: GeometryFlags::OPAQUE,
            vertex_data: Some(vertices.buffer.clone().into_bytes()),
            vertex_stride: mem::size_of::<PositionVertex>() as u32,
            max_vertex: geometry.vertex_count() - 1,
            index_data: Some(IndexBuffer::U32(indices.buffer.clone())),
            transform_data: None,
            ..AccelerationStructureGeometryTrianglesData::new(Format::R32G32B32_SFLOAT)
        };

        let build_info = AccelerationStructureBuildGeometryInfo {
            flags: self.build_flags,
            mode: BuildAccelerationStructureMode::Build,
            ..AccelerationStructureBuildGeometryInfo::new(AccelerationStructureGeometries::Triangles(
                vec![triangles],
            ))
        };

        self.build_acceleration_structure(
            node,
            AccelerationStructureType::BottomLevel,
            build_info,
            geometry.triangle_count(),
        )
    }

    fn build_top_level(
        &mut self,
        node: NodeIndex,
        instances: &[AccelerationStructureInstance],
    ) -> Result<Self::Structure, BuildError> {
        let values = Staging::upload(
            self.memory_allocator.clone(),
            node,
            "instance staging buffer",
            instances.iter().cloned(),
        )?;

        let geometries =
            AccelerationStructureGeometries::Instances(AccelerationStructureGeometryInstancesData {
                flags: GeometryFlags::OPAQUE,
                ..AccelerationStructureGeometryInstancesData::new(
                    AccelerationStructureGeometryInstancesDataType::Values(Some(
                        values.buffer.clone(),
                    )),
                )
            });

        let build_info = AccelerationStructureBuildGeometryInfo {
            flags: self.build_flags,
            mode: BuildAccelerationStructureMode::Build,
            ..AccelerationStructureBuildGeometryInfo::new(geometries)
        };

        self.build_acceleration_structure(
            node,
            AccelerationStructureType::TopLevel,
            build_info,
            instances.len() as u32,
        )
    }

    fn device_address(&self, structure: &Self::Structure) -> u64 {
        structure.device_address().get()
    }
}
