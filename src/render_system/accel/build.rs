//! Turns a prepared scene into BLAS/TLAS structures.
//!
//! Two strategies share one interface. [`MultiLevelStrategy`] keeps the hierarchy and builds
//! a TLAS per internal node that instances its children's structures. [`FlattenedStrategy`]
//! collapses the hierarchy first and builds one TLAS over one BLAS per geometry leaf. The
//! choice is made once, from [`BuildConfig::use_multi_level`].

use ash::vk;
use log::{debug, info};
use nalgebra::Matrix4;
use vulkano::{acceleration_structure::AccelerationStructureInstance, Packed24_8};

use super::{
    aabb::Aabb,
    bounds::{compose_bounds, NodeBounds},
    compact::compact_geometry,
    device::AccelerationStructureDevice,
};
use crate::{
    config::BuildConfig,
    error::{BuildError, SceneError},
    scene::{collapse, prepare, NodeIndex, Scene},
};

// opaque, no back-face culling
const INSTANCE_FLAGS: u8 = (vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE.as_raw()
    | vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()) as u8;
const INSTANCE_MASK: u8 = 0xFF;

/// A bottom-level structure over one compacted triangle cluster.
#[derive(Clone, Debug)]
pub struct Blas<S> {
    pub node: NodeIndex,
    pub structure: S,
    pub device_address: u64,
    // local space, before `transform`
    pub bounds: Aabb,
    // the source node's local transform, used when the BLAS is instanced
    pub transform: Matrix4<f32>,
    pub triangle_count: u32,
}

/// A top-level structure over the instances of one node's children.
#[derive(Clone, Debug)]
pub struct Tlas<S> {
    pub node: NodeIndex,
    pub structure: S,
    pub device_address: u64,
    pub instance_count: u32,
    // local space of `node`
    pub bounds: Aabb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StructureLevel {
    Bottom,
    Top,
}

/// Everything a successful build produced. Only a complete build yields one of these, so the
/// root can be published as soon as it exists.
#[derive(Debug)]
pub struct BuildOutput<S> {
    pub root: Tlas<S>,
    pub bottom_levels: Vec<Blas<S>>,
    // nested TLASes, without the root
    pub top_levels: Vec<Tlas<S>>,
    // every build in the order the device completed it
    pub completion_order: Vec<(StructureLevel, NodeIndex)>,
    pub bounds: NodeBounds,
}

impl<S> BuildOutput<S> {
    pub fn root_structure(&self) -> &S {
        &self.root.structure
    }

    pub fn blas(&self, node: NodeIndex) -> Option<&Blas<S>> {
        self.bottom_levels.iter().find(|b| b.node == node)
    }

    pub fn tlas(&self, node: NodeIndex) -> Option<&Tlas<S>> {
        if self.root.node == node {
            return Some(&self.root);
        }
        self.top_levels.iter().find(|t| t.node == node)
    }
}

/// Row-major 3x4 instance transform: the top three rows of `transform`.
pub fn instance_transform(transform: &Matrix4<f32>) -> [[f32; 4]; 3] {
    let rows: [[f32; 4]; 4] = transform.transpose().into();
    [rows[0], rows[1], rows[2]]
}

/// Places the structure at `address` with `transform`. The custom index carries the source
/// node so shaders can find per-node data.
pub fn instance(transform: &Matrix4<f32>, address: u64, node: NodeIndex) -> AccelerationStructureInstance {
    AccelerationStructureInstance {
        transform: instance_transform(transform),
        instance_custom_index_and_mask: Packed24_8::new(node as u32 & 0x00FF_FFFF, INSTANCE_MASK),
        instance_shader_binding_table_record_offset_and_flags: Packed24_8::new(0, INSTANCE_FLAGS),
        acceleration_structure_reference: address,
    }
}

pub trait BuildStrategy {
    /// Rewrites the scene into the shape `build` expects. Pure, no device work.
    fn prepare(&self, scene: Scene) -> Result<Scene, SceneError>;

    /// Builds every structure of a prepared scene, children before parents.
    fn build<D: AccelerationStructureDevice>(
        &self,
        scene: &Scene,
        device: &mut D,
    ) -> Result<BuildOutput<D::Structure>, BuildError>;
}

// build state shared by both strategies
struct Builder<'a, D: AccelerationStructureDevice> {
    scene: &'a Scene,
    device: &'a mut D,
    max_instance_count: u32,
    bounds: NodeBounds,
    // per node, position in `bottom_levels` / `top_levels`
    built_bottom: Vec<Option<usize>>,
    built_top: Vec<Option<usize>>,
    bottom_levels: Vec<Blas<D::Structure>>,
    top_levels: Vec<Tlas<D::Structure>>,
    completion_order: Vec<(StructureLevel, NodeIndex)>,
}

impl<'a, D: AccelerationStructureDevice> Builder<'a, D> {
    fn new(scene: &'a Scene, device: &'a mut D, max_instance_count: u32) -> Self {
        let count = scene.nodes().len();
        Builder {
            scene,
            device,
            max_instance_count,
            bounds: compose_bounds(scene),
            built_bottom: vec![None; count],
            built_top: vec![None; count],
            bottom_levels: vec![],
            top_levels: vec![],
            completion_order: vec![],
        }
    }

    fn bottom_level(&mut self, node: NodeIndex) -> Result<u64, BuildError> {
        if let Some(i) = self.built_bottom[node] {
            return Ok(self.bottom_levels[i].device_address);
        }

        let geometry = compact_geometry(self.scene, node)?;
        debug!(
            "node {}: building BLAS over {} triangles, vertices {}..={}",
            node,
            geometry.triangle_count(),
            geometry.min_index,
            geometry.max_index
        );
        let structure = self.device.build_bottom_level(&geometry)?;
        let device_address = self.device.device_address(&structure);

        self.completion_order.push((StructureLevel::Bottom, node));
        self.built_bottom[node] = Some(self.bottom_levels.len());
        self.bottom_levels.push(Blas {
            node,
            structure,
            device_address,
            bounds: geometry.bounds,
            transform: self.scene.node(node).transform,
            triangle_count: geometry.triangle_count(),
        });
        Ok(device_address)
    }

    fn top_level(
        &mut self,
        node: NodeIndex,
        instances: &[AccelerationStructureInstance],
    ) -> Result<Tlas<D::Structure>, BuildError> {
        if instances.len() > self.max_instance_count as usize {
            return Err(BuildError::TooManyInstances {
                node,
                count: instances.len(),
                limit: self.max_instance_count,
            });
        }

        debug!("node {}: building TLAS over {} instances", node, instances.len());
        let structure = self.device.build_top_level(node, instances)?;
        let device_address = self.device.device_address(&structure);
        self.completion_order.push((StructureLevel::Top, node));

        Ok(Tlas {
            node,
            structure,
            device_address,
            instance_count: instances.len() as u32,
            bounds: self.bounds.local(node),
        })
    }

    // a leaf at the root still needs a TLAS to be bound: one instance of its own BLAS
    fn leaf_root(&mut self, root: NodeIndex) -> Result<Tlas<D::Structure>, BuildError> {
        let address = self.bottom_level(root)?;
        let transform = self.scene.node(root).transform;
        let mut tlas = self.top_level(root, &[instance(&transform, address, root)])?;
        tlas.bounds = self.bounds.in_parent(self.scene, root);
        Ok(tlas)
    }

    fn finish(self, root: Tlas<D::Structure>) -> BuildOutput<D::Structure> {
        info!(
            "built root TLAS for node {} ({} instances) after {} BLAS and {} nested TLAS builds",
            root.node,
            root.instance_count,
            self.bottom_levels.len(),
            self.top_levels.len()
        );
        BuildOutput {
            root,
            bottom_levels: self.bottom_levels,
            top_levels: self.top_levels,
            completion_order: self.completion_order,
            bounds: self.bounds,
        }
    }
}

/// Nested TLAS per internal node, BLAS per geometry leaf.
#[derive(Clone, Debug)]
pub struct MultiLevelStrategy {
    pub max_instance_count: u32,
}

impl MultiLevelStrategy {
    fn instances_of<D: AccelerationStructureDevice>(
        builder: &mut Builder<'_, D>,
        node: NodeIndex,
    ) -> Result<Vec<AccelerationStructureInstance>, BuildError> {
        let scene = builder.scene;
        let mut instances = Vec::with_capacity(scene.node(node).num_children());
        for child in scene.children(node) {
            let address = if scene.node(child).is_geometry_leaf() {
                builder.bottom_level(child)?
            } else {
                Self::nested_top_level(builder, child)?
            };
            instances.push(instance(&scene.node(child).transform, address, child));
        }
        Ok(instances)
    }

    fn nested_top_level<D: AccelerationStructureDevice>(
        builder: &mut Builder<'_, D>,
        node: NodeIndex,
    ) -> Result<u64, BuildError> {
        if let Some(i) = builder.built_top[node] {
            return Ok(builder.top_levels[i].device_address);
        }
        let instances = Self::instances_of(builder, node)?;
        let tlas = builder.top_level(node, &instances)?;
        let address = tlas.device_address;
        builder.built_top[node] = Some(builder.top_levels.len());
        builder.top_levels.push(tlas);
        Ok(address)
    }
}

impl BuildStrategy for MultiLevelStrategy {
    fn prepare(&self, mut scene: Scene) -> Result<Scene, SceneError> {
        prepare::split_mixed_nodes(&mut scene)?;
        scene.validate()?;
        prepare::cap_instance_lists(&mut scene, self.max_instance_count)?;
        scene.assign_levels();
        info!(
            "prepared multi-level scene: {} nodes, {} triangles",
            scene.nodes().len(),
            scene.node(scene.root()).total_primitive_count
        );
        Ok(scene)
    }

    fn build<D: AccelerationStructureDevice>(
        &self,
        scene: &Scene,
        device: &mut D,
    ) -> Result<BuildOutput<D::Structure>, BuildError> {
        scene.validate()?;
        let mut builder = Builder::new(scene, device, self.max_instance_count);
        let root = scene.root();
        let tlas = if scene.node(root).is_geometry_leaf() {
            builder.leaf_root(root)?
        } else {
            let instances = Self::instances_of(&mut builder, root)?;
            builder.top_level(root, &instances)?
        };
        Ok(builder.finish(tlas))
    }
}

/// One TLAS over the collapsed leaves.
#[derive(Clone, Debug)]
pub struct FlattenedStrategy {
    pub max_instance_count: u32,
}

impl BuildStrategy for FlattenedStrategy {
    fn prepare(&self, mut scene: Scene) -> Result<Scene, SceneError> {
        prepare::split_mixed_nodes(&mut scene)?;
        let scene = collapse::collapse_parent_nodes(scene)?;
        info!(
            "collapsed scene to {} geometry leaves",
            scene.node(scene.root()).num_children()
        );
        Ok(scene)
    }

    fn build<D: AccelerationStructureDevice>(
        &self,
        scene: &Scene,
        device: &mut D,
    ) -> Result<BuildOutput<D::Structure>, BuildError> {
        scene.validate()?;
        let root = scene.root();
        if let Some(child) = scene.children(root).find(|&c| !scene.node(c).is_geometry_leaf()) {
            return Err(BuildError::NotFlattened { node: root, child });
        }

        let mut builder = Builder::new(scene, device, self.max_instance_count);
        let tlas = if scene.node(root).is_geometry_leaf() {
            builder.leaf_root(root)?
        } else {
            let count = scene.node(root).num_children();
            if count > self.max_instance_count as usize {
                return Err(BuildError::TooManyInstances {
                    node: root,
                    count,
                    limit: self.max_instance_count,
                });
            }
            let mut instances = Vec::with_capacity(count);
            for child in scene.children(root) {
                let address = builder.bottom_level(child)?;
                instances.push(instance(&scene.node(child).transform, address, child));
            }
            builder.top_level(root, &instances)?
        };
        Ok(builder.finish(tlas))
    }
}

/// The strategy selected for a scene, fixed for its whole preparation.
#[derive(Clone, Debug)]
pub enum HierarchyStrategy {
    MultiLevel(MultiLevelStrategy),
    Flattened(FlattenedStrategy),
}

impl HierarchyStrategy {
    pub fn from_config(config: &BuildConfig) -> HierarchyStrategy {
        if config.use_multi_level {
            HierarchyStrategy::MultiLevel(MultiLevelStrategy {
                max_instance_count: config.max_instance_count,
            })
        } else {
            HierarchyStrategy::Flattened(FlattenedStrategy {
                max_instance_count: config.max_instance_count,
            })
        }
    }
}

impl BuildStrategy for HierarchyStrategy {
    fn prepare(&self, scene: Scene) -> Result<Scene, SceneError> {
        match self {
            HierarchyStrategy::MultiLevel(strategy) => strategy.prepare(scene),
            HierarchyStrategy::Flattened(strategy) => strategy.prepare(scene),
        }
    }

    fn build<D: AccelerationStructureDevice>(
        &self,
        scene: &Scene,
        device: &mut D,
    ) -> Result<BuildOutput<D::Structure>, BuildError> {
        match self {
            HierarchyStrategy::MultiLevel(strategy) => strategy.build(scene, device),
            HierarchyStrategy::Flattened(strategy) => strategy.build(scene, device),
        }
    }
}
