//! Kernel emulation for oxidized-xenon
//!
//! Owns everything the guest title sees as "the system": the object table,
//! guest threads, loaded user modules, installed content and the built-in
//! kernel modules whose exports titles import.

pub mod content;
pub mod game_info;
pub mod kernel_modules;
pub mod kernel_state;
pub mod objects;
pub mod package_resolver;
pub mod thread;
pub mod user_module;

pub use content::{ContentData, ContentManager};
pub use game_info::GameInfo;
pub use kernel_state::KernelState;
pub use objects::{Handle, KernelObject, ObjectTable, ObjectType};
pub use thread::XThread;
pub use user_module::{LoadStage, UserModule};
