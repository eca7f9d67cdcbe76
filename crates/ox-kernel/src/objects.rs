//! Kernel object table

use ox_core::error::KernelError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Guest-visible object handle
pub type Handle = u32;

/// First handle handed out; 0 is never valid
const FIRST_HANDLE: Handle = 0xF800_0004;
const HANDLE_STRIDE: Handle = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Thread,
    Module,
}

pub trait KernelObject: Send + Sync + std::any::Any {
    fn object_type(&self) -> ObjectType;
    fn handle(&self) -> Handle;

    /// Helper for downcasting
    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync>;
}

/// Handle -> object map
pub struct ObjectTable {
    next_handle: AtomicU32,
    objects: RwLock<BTreeMap<Handle, Arc<dyn KernelObject>>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU32::new(FIRST_HANDLE),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn allocate_handle(&self) -> Handle {
        self.next_handle.fetch_add(HANDLE_STRIDE, Ordering::Relaxed)
    }

    /// Make sure `handle` is never handed out again (restored objects keep
    /// their saved handles)
    pub fn reserve_handle(&self, handle: Handle) {
        self.next_handle
            .fetch_max(handle.wrapping_add(HANDLE_STRIDE), Ordering::Relaxed);
    }

    pub fn register(&self, object: Arc<dyn KernelObject>) -> Handle {
        let handle = object.handle();
        self.objects.write().insert(handle, object);
        handle
    }

    pub fn unregister(&self, handle: Handle) -> Result<(), KernelError> {
        self.objects
            .write()
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| KernelError::NotFound(format!("handle {:08X}", handle)))
    }

    pub fn get<T: KernelObject + 'static>(&self, handle: Handle) -> Result<Arc<T>, KernelError> {
        let object = self
            .objects
            .read()
            .get(&handle)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(format!("handle {:08X}", handle)))?;
        object
            .as_any()
            .downcast::<T>()
            .map_err(|_| KernelError::InvalidState(format!("handle {:08X} has another type", handle)))
    }

    pub fn exists(&self, handle: Handle) -> bool {
        self.objects.read().contains_key(&handle)
    }

    pub fn count(&self) -> usize {
        self.objects.read().len()
    }

    /// All live objects of one type, downcast, in handle order
    pub fn objects_of<T: KernelObject + 'static>(&self, object_type: ObjectType) -> Vec<Arc<T>> {
        self.objects
            .read()
            .values()
            .filter(|o| o.object_type() == object_type)
            .cloned()
            .filter_map(|o| o.as_any().downcast::<T>().ok())
            .collect()
    }

    pub fn clear(&self) {
        self.objects.write().clear();
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
