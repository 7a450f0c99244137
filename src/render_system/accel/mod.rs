pub mod aabb;
pub mod bounds;
pub mod build;
pub mod compact;
pub mod device;
