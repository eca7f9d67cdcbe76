//! Processor backend contract

use crate::context::ThreadContext;
use parking_lot::RwLock;
use std::time::Duration;

/// Host code cache base used by the null backend
pub const NULL_CODE_CACHE_BASE: u64 = 0xA000_0000;
/// Host code cache size used by the null backend
pub const NULL_CODE_CACHE_SIZE: u64 = 0x0100_0000;

/// A translated guest function living in the code cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFunction {
    pub name: String,
    /// Guest address of the first instruction
    pub guest_address: u32,
    /// Host address of the translated code
    pub host_start: u64,
    pub host_size: u64,
    /// (host offset, guest address) pairs sorted by host offset
    pub source_map: Vec<(u64, u32)>,
}

impl GuestFunction {
    pub fn contains_host_pc(&self, host_pc: u64) -> bool {
        host_pc >= self.host_start && host_pc - self.host_start < self.host_size
    }

    /// Map a host program counter inside this function back to guest code
    pub fn map_host_to_guest(&self, host_pc: u64) -> u32 {
        let offset = host_pc.saturating_sub(self.host_start);
        self.source_map
            .iter()
            .take_while(|(host_offset, _)| *host_offset <= offset)
            .last()
            .map(|(_, guest)| *guest)
            .unwrap_or(self.guest_address)
    }
}

/// Callbacks a backend makes while running guest code
pub trait ExecutionHooks {
    /// Called at every safe point. Suspension happens inside this call;
    /// returning false asks the backend to stop executing the thread.
    fn checkpoint(&self, ctx: &mut ThreadContext) -> bool;
}

/// Instruction translation backend
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn initialize(&self) -> bool {
        true
    }

    /// Host address where translated code begins
    fn code_cache_base(&self) -> u64;

    /// Size of the host code cache in bytes
    fn code_cache_size(&self) -> u64;

    fn code_cache_contains(&self, host_pc: u64) -> bool {
        let base = self.code_cache_base();
        host_pc >= base && host_pc - base < self.code_cache_size()
    }

    /// Translated function containing `host_pc`, if any
    fn lookup_function(&self, host_pc: u64) -> Option<GuestFunction>;

    /// Run guest code on the calling thread starting at `entry`
    fn execute(&self, ctx: &mut ThreadContext, entry: u32, hooks: &dyn ExecutionHooks);
}

/// Backend that translates nothing.
///
/// Threads spin on safe points until asked to stop, or until `step_limit`
/// checkpoints have passed, which models a guest thread returning.
pub struct NullBackend {
    functions: RwLock<Vec<GuestFunction>>,
    step_limit: Option<u64>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(Vec::new()),
            step_limit: None,
        }
    }

    /// Backend whose threads return on their own after `steps` safe points
    pub fn with_step_limit(steps: u64) -> Self {
        Self {
            functions: RwLock::new(Vec::new()),
            step_limit: Some(steps),
        }
    }

    /// Record a function as if it had been translated into the code cache
    pub fn declare_function(&self, function: GuestFunction) {
        self.functions.write().push(function);
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn code_cache_base(&self) -> u64 {
        NULL_CODE_CACHE_BASE
    }

    fn code_cache_size(&self) -> u64 {
        NULL_CODE_CACHE_SIZE
    }

    fn lookup_function(&self, host_pc: u64) -> Option<GuestFunction> {
        self.functions
            .read()
            .iter()
            .find(|f| f.contains_host_pc(host_pc))
            .cloned()
    }

    fn execute(&self, ctx: &mut ThreadContext, entry: u32, hooks: &dyn ExecutionHooks) {
        ctx.pc = entry;
        let mut steps = 0u64;
        while hooks.checkpoint(ctx) {
            steps += 1;
            if self.step_limit.is_some_and(|limit| steps >= limit) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingHooks {
        calls: Cell<u32>,
        stop_after: u32,
    }

    impl ExecutionHooks for CountingHooks {
        fn checkpoint(&self, _ctx: &mut ThreadContext) -> bool {
            self.calls.set(self.calls.get() + 1);
            self.calls.get() < self.stop_after
        }
    }

    #[test]
    fn test_code_cache_range() {
        let backend = NullBackend::new();
        assert!(backend.code_cache_contains(NULL_CODE_CACHE_BASE));
        assert!(backend.code_cache_contains(NULL_CODE_CACHE_BASE + NULL_CODE_CACHE_SIZE - 1));
        assert!(!backend.code_cache_contains(NULL_CODE_CACHE_BASE + NULL_CODE_CACHE_SIZE));
        assert!(!backend.code_cache_contains(0x1000));
    }

    #[test]
    fn test_function_source_map() {
        let backend = NullBackend::new();
        backend.declare_function(GuestFunction {
            name: "sub_82000000".into(),
            guest_address: 0x8200_0000,
            host_start: NULL_CODE_CACHE_BASE + 0x100,
            host_size: 0x40,
            source_map: vec![(0x0, 0x8200_0000), (0x10, 0x8200_0004), (0x20, 0x8200_0008)],
        });

        let function = backend.lookup_function(NULL_CODE_CACHE_BASE + 0x118).unwrap();
        assert_eq!(function.map_host_to_guest(NULL_CODE_CACHE_BASE + 0x118), 0x8200_0004);
        assert!(backend.lookup_function(NULL_CODE_CACHE_BASE).is_none());
    }

    #[test]
    fn test_execute_stops_when_hooks_say_so() {
        let backend = NullBackend::new();
        let hooks = CountingHooks {
            calls: Cell::new(0),
            stop_after: 3,
        };
        let mut ctx = ThreadContext::new();
        backend.execute(&mut ctx, 0x8200_0000, &hooks);
        assert_eq!(hooks.calls.get(), 3);
        assert_eq!(ctx.pc, 0x8200_0000);
    }
}
