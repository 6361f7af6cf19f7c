//! Reference-counted containers shared by concurrently queued tasks
//!
//! An archive is opened once by the enumerator and read by many loader tasks.
//! Each queued task holds a claim; the container closes exactly once, when the
//! last claim is released.

use std::io;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::error::LoadError;

/// A container that must be closed explicitly.
pub trait Closeable: Send {
    fn close(&mut self) -> io::Result<()>;
}

#[derive(Debug)]
struct State<R> {
    count: usize,
    resource: Option<R>,
}

/// Open container plus a claim count under one mutex.
///
/// Invariant: the resource is open iff it has never reached zero claims after
/// its first acquire. `release` past zero is a programming error.
#[derive(Debug)]
pub struct SharedResource<R: Closeable> {
    name: String,
    state: Mutex<State<R>>,
}

impl<R: Closeable> SharedResource<R> {
    /// Wrap an already opened container with zero claims.
    pub fn new(name: impl Into<String>, resource: R) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                count: 0,
                resource: Some(resource),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take one claim. Fails once the container has been closed.
    pub fn acquire(&self) -> Result<usize, LoadError> {
        let mut state = self.state.lock().expect("resource lock poisoned");
        if state.resource.is_none() {
            return Err(LoadError::Resource(format!(
                "{}: acquire after close",
                self.name
            )));
        }
        state.count += 1;
        Ok(state.count)
    }

    /// Drop one claim, closing the container when the count reaches zero.
    ///
    /// Returns the remaining count.
    pub fn release(&self) -> Result<usize, LoadError> {
        let mut state = self.state.lock().expect("resource lock poisoned");
        if state.count == 0 {
            return Err(LoadError::Resource(format!(
                "{}: release without matching acquire",
                self.name
            )));
        }
        state.count -= 1;
        if state.count == 0 {
            if let Some(mut resource) = state.resource.take() {
                log::debug!("{}: last claim released, closing", self.name);
                resource.close()?;
            }
        }
        Ok(state.count)
    }

    pub fn count(&self) -> usize {
        self.state.lock().expect("resource lock poisoned").count
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .expect("resource lock poisoned")
            .resource
            .is_some()
    }

    /// Run `f` with exclusive access to the open container.
    pub fn with<T>(&self, f: impl FnOnce(&mut R) -> io::Result<T>) -> Result<T, LoadError> {
        let mut state = self.state.lock().expect("resource lock poisoned");
        match state.resource.as_mut() {
            Some(resource) => Ok(f(resource)?),
            None => Err(LoadError::Resource(format!(
                "{}: access after close",
                self.name
            ))),
        }
    }
}

/// Name-keyed table of open containers.
///
/// Lets loaders release claims by name without knowing which sibling tasks
/// share their container. Entries leave the table when they close.
pub struct ResourceTable<R: Closeable> {
    map: Mutex<FxHashMap<String, Arc<SharedResource<R>>>>,
}

impl<R: Closeable> ResourceTable<R> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(FxHashMap::default()),
        }
    }

    /// Register an opened container, or return the one already registered.
    pub fn insert(
        &self,
        name: &str,
        open: impl FnOnce() -> io::Result<R>,
    ) -> Result<Arc<SharedResource<R>>, LoadError> {
        let mut map = self.map.lock().expect("resource table poisoned");
        if let Some(existing) = map.get(name).filter(|r| r.is_open()) {
            return Ok(existing.clone());
        }
        let resource = Arc::new(SharedResource::new(name, open()?));
        map.insert(name.to_string(), resource.clone());
        Ok(resource)
    }

    /// Take a claim on a registered container.
    pub fn claim(self: &Arc<Self>, name: &str) -> Result<ResourceClaim<R>, LoadError> {
        let resource = self
            .get(name)
            .ok_or_else(|| LoadError::Resource(format!("{name}: not registered")))?;
        resource.acquire()?;
        Ok(ResourceClaim {
            resource,
            table: self.clone(),
            released: false,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<SharedResource<R>>> {
        self.map
            .lock()
            .expect("resource table poisoned")
            .get(name)
            .cloned()
    }

    /// Release one claim by name, dropping the entry once it closes.
    pub fn release(&self, name: &str) -> Result<usize, LoadError> {
        let resource = self.get(name).ok_or_else(|| {
            LoadError::Resource(format!("{name}: release of unknown container"))
        })?;
        let remaining = resource.release()?;
        if remaining == 0 {
            let mut map = self.map.lock().expect("resource table poisoned");
            if map.get(name).is_some_and(|r| Arc::ptr_eq(r, &resource)) {
                map.remove(name);
            }
        }
        Ok(remaining)
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("resource table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Closeable> Default for ResourceTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// One claim on a tabled container, released on drop.
///
/// Tasks discarded from a queue still release their claim this way.
pub struct ResourceClaim<R: Closeable> {
    resource: Arc<SharedResource<R>>,
    table: Arc<ResourceTable<R>>,
    released: bool,
}

impl<R: Closeable> ResourceClaim<R> {
    pub fn resource(&self) -> &SharedResource<R> {
        &self.resource
    }

    /// Release now, surfacing errors the drop path can only log.
    pub fn release(mut self) -> Result<usize, LoadError> {
        self.released = true;
        self.table.release(self.resource.name())
    }
}

impl<R: Closeable> Drop for ResourceClaim<R> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.table.release(self.resource.name()) {
            log::error!("{e}");
        }
    }
}

impl<R: Closeable> std::fmt::Debug for ResourceClaim<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceClaim")
            .field("name", &self.resource.name())
            .finish_non_exhaustive()
    }
}
