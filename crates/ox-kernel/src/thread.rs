//! Guest threads
//!
//! Each guest thread runs on its own host thread. Suspension is
//! cooperative: the backend calls back into [`ExecutionHooks::checkpoint`]
//! at safe points, and a suspended thread parks there until its suspend
//! count drops back to zero or it is asked to terminate.

use crate::objects::{Handle, KernelObject, ObjectType};
use ox_core::error::{KernelError, SnapshotError};
use ox_core::{ByteReader, ByteWriter};
use ox_cpu::{ExecutionHooks, Processor, ThreadContext};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Arc<XThread>>> = const { RefCell::new(None) };
}

/// Creation parameters
#[derive(Debug, Clone)]
pub struct ThreadParams {
    pub name: String,
    pub thread_id: u32,
    pub entry_point: u32,
    pub stack_base: u32,
    pub stack_size: u32,
    pub is_main: bool,
    /// Host-internal threads are never suspended by the debugger or pause
    pub can_debugger_suspend: bool,
}

#[derive(Debug, Default)]
struct RunState {
    suspend_count: u32,
    started: bool,
    running: bool,
    exited: bool,
    /// Parked at a safe point because of a suspend
    parked: bool,
}

pub struct XThread {
    handle: Handle,
    params: ThreadParams,
    state: Mutex<RunState>,
    changed: Condvar,
    terminate_requested: AtomicBool,
    context: Mutex<ThreadContext>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl XThread {
    pub fn new(handle: Handle, params: ThreadParams, context: ThreadContext) -> Arc<Self> {
        Arc::new(Self {
            handle,
            params,
            state: Mutex::new(RunState::default()),
            changed: Condvar::new(),
            terminate_requested: AtomicBool::new(false),
            context: Mutex::new(context),
            join: Mutex::new(None),
        })
    }

    /// The guest thread running on the calling host thread, if any
    pub fn current() -> Option<Arc<XThread>> {
        CURRENT_THREAD.with(|current| current.borrow().clone())
    }

    pub fn is_current(&self) -> bool {
        Self::current().is_some_and(|t| t.handle == self.handle)
    }

    pub fn thread_id(&self) -> u32 {
        self.params.thread_id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn params(&self) -> &ThreadParams {
        &self.params
    }

    pub fn is_main(&self) -> bool {
        self.params.is_main
    }

    pub fn can_debugger_suspend(&self) -> bool {
        self.params.can_debugger_suspend
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn has_exited(&self) -> bool {
        self.state.lock().exited
    }

    pub fn suspend_count(&self) -> u32 {
        self.state.lock().suspend_count
    }

    /// Whether the thread is parked at a safe point
    pub fn is_parked(&self) -> bool {
        self.state.lock().parked
    }

    pub fn context(&self) -> ThreadContext {
        self.context.lock().clone()
    }

    /// Spawn the host thread. Execution begins at the entry point, or at
    /// the saved program counter for a restored thread.
    pub fn start(self: &Arc<Self>, processor: Arc<Processor>) -> Result<(), KernelError> {
        {
            let mut state = self.state.lock();
            if state.started {
                return Err(KernelError::InvalidState(format!(
                    "thread {} already started",
                    self.params.name
                )));
            }
            state.started = true;
            state.running = true;
        }

        let thread = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(self.params.name.clone())
            .spawn(move || thread.run(processor));

        match spawned {
            Ok(join) => {
                *self.join.lock() = Some(join);
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.running = false;
                state.exited = true;
                self.changed.notify_all();
                Err(KernelError::Unsuccessful(format!(
                    "could not spawn thread {}: {}",
                    self.params.name, e
                )))
            }
        }
    }

    fn run(self: Arc<Self>, processor: Arc<Processor>) {
        CURRENT_THREAD.with(|current| *current.borrow_mut() = Some(Arc::clone(&self)));
        debug!(
            "Thread {} ({:08X}) starting at 0x{:08X}",
            self.params.name, self.handle, self.params.entry_point
        );

        let mut ctx = self.context.lock().clone();
        let entry = if ctx.pc != 0 { ctx.pc } else { self.params.entry_point };
        if let Err(e) = processor.execute(&mut ctx, entry, &*self) {
            warn!("Thread {} could not execute: {}", self.params.name, e);
        }
        *self.context.lock() = ctx;

        let mut state = self.state.lock();
        state.running = false;
        state.exited = true;
        self.changed.notify_all();
        drop(state);

        CURRENT_THREAD.with(|current| *current.borrow_mut() = None);
        debug!("Thread {} exited", self.params.name);
    }

    /// Increment the suspend count, returning the previous count
    pub fn suspend(&self) -> u32 {
        let mut state = self.state.lock();
        let previous = state.suspend_count;
        state.suspend_count += 1;
        previous
    }

    /// Decrement the suspend count, returning the previous count
    pub fn resume(&self) -> u32 {
        let mut state = self.state.lock();
        let previous = state.suspend_count;
        if previous > 0 {
            state.suspend_count -= 1;
            if state.suspend_count == 0 {
                self.changed.notify_all();
            }
        }
        previous
    }

    /// Block the calling guest thread while it is suspended. Returns false
    /// once termination has been requested.
    pub fn wait_while_suspended(&self) -> bool {
        let mut state = self.state.lock();
        while state.suspend_count > 0 && !self.terminate_requested.load(Ordering::SeqCst) {
            state.parked = true;
            self.changed.notify_all();
            self.changed.wait(&mut state);
        }
        state.parked = false;
        !self.terminate_requested.load(Ordering::SeqCst)
    }

    /// Block until a suspended thread has parked at a safe point, so its
    /// saved context is current. Returns at once for the calling thread,
    /// a thread that is not suspended, or one that has stopped running.
    pub fn wait_until_parked(&self) {
        if self.is_current() {
            return;
        }
        let mut state = self.state.lock();
        while state.running
            && state.suspend_count > 0
            && !state.parked
            && !self.terminate_requested.load(Ordering::SeqCst)
        {
            self.changed.wait(&mut state);
        }
    }

    /// Ask the thread to stop at its next safe point
    pub fn request_terminate(&self) {
        self.terminate_requested.store(true, Ordering::SeqCst);
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    /// Block until the thread has exited. Returns immediately for a thread
    /// that was never started.
    pub fn wait_exit(&self) {
        let mut state = self.state.lock();
        while state.started && !state.exited {
            self.changed.wait(&mut state);
        }
    }

    /// Request termination and join the host thread
    pub fn terminate(&self) {
        self.request_terminate();
        if self.is_current() {
            return;
        }
        let join = self.join.lock().take();
        if let Some(join) = join {
            if join.join().is_err() {
                warn!("Thread {} panicked", self.params.name);
            }
        }
    }

    pub fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError> {
        stream.write_u32(self.handle)?;
        stream.write_string(&self.params.name)?;
        stream.write_u32(self.params.thread_id)?;
        stream.write_u32(self.params.entry_point)?;
        stream.write_u32(self.params.stack_base)?;
        stream.write_u32(self.params.stack_size)?;
        stream.write_bool(self.params.is_main)?;
        stream.write_bool(self.params.can_debugger_suspend)?;
        self.context.lock().save(stream)
    }

    /// Recreate a saved thread. It comes back suspended once and must be
    /// started and resumed by the caller.
    pub fn restore(stream: &mut ByteReader) -> Result<Arc<Self>, SnapshotError> {
        let handle = stream.read_u32()?;
        let params = ThreadParams {
            name: stream.read_string()?,
            thread_id: stream.read_u32()?,
            entry_point: stream.read_u32()?,
            stack_base: stream.read_u32()?,
            stack_size: stream.read_u32()?,
            is_main: stream.read_bool()?,
            can_debugger_suspend: stream.read_bool()?,
        };
        let context = ThreadContext::restore(stream)?;
        let thread = Self::new(handle, params, context);
        thread.suspend();
        Ok(thread)
    }
}

impl ExecutionHooks for XThread {
    fn checkpoint(&self, ctx: &mut ThreadContext) -> bool {
        *self.context.lock() = ctx.clone();
        if self.terminate_requested.load(Ordering::SeqCst) {
            return false;
        }
        self.wait_while_suspended()
    }
}

impl KernelObject for XThread {
    fn object_type(&self) -> ObjectType {
        ObjectType::Thread
    }

    fn handle(&self) -> Handle {
        self.handle
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for XThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XThread")
            .field("handle", &self.handle)
            .field("name", &self.params.name)
            .field("thread_id", &self.params.thread_id)
            .field("main", &self.params.is_main)
            .finish()
    }
}
