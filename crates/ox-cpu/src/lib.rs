//! Processor facade for oxidized-xenon
//!
//! Instruction translation lives behind the [`Backend`] trait; this crate
//! only carries what the rest of the emulator needs to talk to it: the
//! code cache range used to classify host faults, per-thread register
//! state, the table of kernel exports guest imports are linked against,
//! and the registry of loaded guest modules.

pub mod backend;
pub mod context;
pub mod exception;
pub mod export_resolver;
pub mod processor;

pub use backend::{Backend, ExecutionHooks, GuestFunction, NullBackend};
pub use context::ThreadContext;
pub use exception::{ExceptionCode, HostException};
pub use export_resolver::{Export, ExportKind, ExportResolver};
pub use processor::{Debugger, ModuleRange, Processor};
