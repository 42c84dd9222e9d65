//! Loader functions and their registry.
//!
//! A [`Loader`] computes the value for a key and is responsible for storing it
//! (cache view `save`) itself. [`CacheLoaderAdapter`] turns a typed
//! [`CacheLoader`] that just returns the value into a `Loader` that saves it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use loadcache_core::{LoadTaskId, LoadType, LoaderError};

use crate::cache_view::CacheViewService;

/// Everything a loader gets to know about the attempt it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadContext {
    pub task_id: LoadTaskId,
    pub load_type: LoadType,
    pub key: String,
    /// 1-based execution number.
    pub attempt: u32,
    /// State left by a previous transient failure, if the loader recorded any.
    pub resume_state: Option<JsonValue>,
}

pub trait Loader: Send + Sync {
    fn load(&self, ctx: &LoadContext) -> Result<(), LoaderError>;
}

impl<F> Loader for F
where
    F: Fn(&LoadContext) -> Result<(), LoaderError> + Send + Sync,
{
    fn load(&self, ctx: &LoadContext) -> Result<(), LoaderError> {
        self(ctx)
    }
}

/// Loader that produces a typed value instead of saving it.
pub trait CacheLoader<T>: Send + Sync {
    fn load(&self, ctx: &LoadContext) -> Result<T, LoaderError>;
}

/// Saves whatever the wrapped [`CacheLoader`] produces through the cache view.
pub struct CacheLoaderAdapter<T, L> {
    loader: L,
    view: CacheViewService<T>,
}

impl<T, L> CacheLoaderAdapter<T, L>
where
    T: Serialize + DeserializeOwned,
    L: CacheLoader<T>,
{
    pub fn new(loader: L, view: CacheViewService<T>) -> Self {
        Self { loader, view }
    }
}

impl<T, L> Loader for CacheLoaderAdapter<T, L>
where
    T: Serialize + DeserializeOwned,
    L: CacheLoader<T>,
{
    fn load(&self, ctx: &LoadContext) -> Result<(), LoaderError> {
        let value = self.loader.load(ctx)?;
        self.view
            .save(&ctx.key, &value)
            .map_err(|e| LoaderError::transient(format!("saving loaded value: {e}")))
    }
}

/// One loader per load type.
#[derive(Default, Clone)]
pub struct LoaderRegistry {
    loaders: HashMap<LoadType, Arc<dyn Loader>>,
}

impl core::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("load_types", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the loader for a type.
    pub fn register(&mut self, load_type: LoadType, loader: impl Loader + 'static) {
        self.loaders.insert(load_type, Arc::new(loader));
    }

    pub fn get(&self, load_type: &LoadType) -> Option<Arc<dyn Loader>> {
        self.loaders.get(load_type).cloned()
    }

    pub fn load_types(&self) -> impl Iterator<Item = &LoadType> {
        self.loaders.keys()
    }
}
