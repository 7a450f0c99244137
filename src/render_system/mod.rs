pub mod accel;
pub mod context;
pub mod descriptor;
pub mod vertex;
