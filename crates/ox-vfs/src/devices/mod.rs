//! Device implementations

pub mod disc_image;
pub mod host_path;
