use std::path::PathBuf;

use thiserror::Error;

use crate::scene::NodeIndex;

/// Malformed or unreadable scene data.
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("scene has no nodes")]
    Empty,

    #[error("node {node}: children {start}..{end} exceed the node index table (length {len})")]
    ChildrenOutOfBounds {
        node: NodeIndex,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("node {node}: child slot {slot} names node {child} but the scene has {count} nodes")]
    ChildOutOfRange {
        node: NodeIndex,
        slot: usize,
        child: u32,
        count: usize,
    },

    #[error("node {node}: triangles {start}..{end} exceed the index buffer (length {len})")]
    TrianglesOutOfBounds {
        node: NodeIndex,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("node {node}: index {position} names vertex {vertex} but the scene has {count} vertices")]
    VertexOutOfRange {
        node: NodeIndex,
        position: usize,
        vertex: u32,
        count: usize,
    },

    #[error("node {node}: declares geometry at index {index_buffer_index} but has no triangles")]
    EmptyGeometry {
        node: NodeIndex,
        index_buffer_index: i32,
    },

    #[error("node {node}: has {num_triangles} triangles but no index buffer offset")]
    MissingIndexBuffer { node: NodeIndex, num_triangles: i32 },

    #[error("node {node}: negative child count {num_children}")]
    NegativeChildCount { node: NodeIndex, num_children: i32 },

    #[error("node {node}: references neither geometry nor children")]
    EmptyNode { node: NodeIndex },

    #[error("node {node}: references both geometry and children")]
    MixedNode { node: NodeIndex },

    #[error("node {node}: is its own ancestor")]
    Cycle { node: NodeIndex },

    #[error("instance limit {limit} is below the minimum of {minimum}")]
    InstanceLimitTooSmall { limit: u32, minimum: u32 },

    #[error("failed to read scene file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scene: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure while building acceleration structures. None of these are retried.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error("node {node}: failed to allocate {what}: {message}")]
    Allocation {
        node: NodeIndex,
        what: &'static str,
        message: String,
    },

    #[error("node {node}: build size query failed: {message}")]
    SizeQuery { node: NodeIndex, message: String },

    #[error("node {node}: recording the build failed: {message}")]
    Record { node: NodeIndex, message: String },

    #[error("node {node}: submission failed: {message}")]
    Submission { node: NodeIndex, message: String },

    #[error("node {node}: {count} instances exceed the limit of {limit}")]
    TooManyInstances {
        node: NodeIndex,
        count: usize,
        limit: u32,
    },

    #[error("node {node}: child {child} is not a geometry leaf, scene was not flattened")]
    NotFlattened { node: NodeIndex, child: NodeIndex },

    #[error("failed to bind the root acceleration structure: {0}")]
    Descriptor(String),

    #[error("no usable ray tracing device: {0}")]
    Device(String),
}
