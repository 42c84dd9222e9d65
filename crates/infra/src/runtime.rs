//! Wiring of the subsystem into a running process.
//!
//! ```text
//! LoaderRuntime::builder(config, stores, dispatch_bus, notification_bus, clock)
//!     .register_cache_loader(item_meta, ItemMetaLoader)
//!     .listener_group(ListenerGroup::new("search-index", item_meta).with_listener(..))
//!     .start()?
//!
//!   ├─ one LoadWorker consumer per (load type, partition)  [enable_workers]
//!   ├─ retry sweeper on sweep_interval                     [enable_retry_sweeper]
//!   └─ one consumer per (listener group, partition)        [enable_notifications]
//! ```
//!
//! Cache views may be created before or after `start()`; they only need the
//! stores and the dispatcher.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use loadcache_core::{Clock, LoadType};
use loadcache_events::{
    DispatchMessage, InMemoryMessageBus, LoadNotification, LoadTopics, MessageBus,
};

use crate::cache_view::CacheViewService;
use crate::config::LoaderConfig;
use crate::dispatcher::{LoadDispatcher, LoadScheduler};
use crate::error::LoadError;
use crate::execution::LoadWorker;
use crate::loader::{CacheLoader, CacheLoaderAdapter, Loader, LoaderRegistry};
use crate::notifications::{ListenerGroup, NotificationFanout, Notifier};
use crate::retry::RetryPolicies;
use crate::store::{
    CacheStore, InMemoryCacheStore, InMemoryTaskPointerIndex, InMemoryTaskStatusStore,
    TaskPointerIndex, TaskStatusStore,
};
use crate::sweeper::RetrySweeper;
use crate::workers::WorkerHandle;

/// Consumer group shared by every execution worker of a load type.
pub const LOAD_WORKER_GROUP: &str = "load-workers";

/// The three stores behind the subsystem.
#[derive(Clone)]
pub struct LoaderStores {
    pub status: Arc<dyn TaskStatusStore>,
    pub cache: Arc<dyn CacheStore>,
    pub pointers: Arc<dyn TaskPointerIndex>,
}

impl LoaderStores {
    pub fn in_memory() -> Self {
        Self {
            status: InMemoryTaskStatusStore::arc(),
            cache: Arc::new(InMemoryCacheStore::new()),
            pointers: Arc::new(InMemoryTaskPointerIndex::new()),
        }
    }
}

pub struct LoaderRuntimeBuilder<DB, NB> {
    config: LoaderConfig,
    stores: LoaderStores,
    dispatch_bus: Arc<DB>,
    notification_bus: Arc<NB>,
    clock: Arc<dyn Clock>,
    topics: LoadTopics,
    scheduler: Arc<dyn LoadScheduler>,
    loaders: LoaderRegistry,
    listener_groups: Vec<ListenerGroup>,
}

impl<DB, NB> LoaderRuntimeBuilder<DB, NB>
where
    DB: MessageBus<DispatchMessage> + 'static,
    NB: MessageBus<LoadNotification> + 'static,
{
    fn new(
        config: LoaderConfig,
        stores: LoaderStores,
        dispatch_bus: DB,
        notification_bus: NB,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let topics = LoadTopics::new(config.topic_prefix.clone());
        let dispatch_bus = Arc::new(dispatch_bus);
        let scheduler: Arc<dyn LoadScheduler> = Arc::new(LoadDispatcher::new(
            stores.status.clone(),
            dispatch_bus.clone(),
            topics.clone(),
            clock.clone(),
        ));

        Self {
            config,
            stores,
            dispatch_bus,
            notification_bus: Arc::new(notification_bus),
            clock,
            topics,
            scheduler,
            loaders: LoaderRegistry::new(),
            listener_groups: Vec::new(),
        }
    }

    /// Typed cache view over `load_type`, usable before the runtime starts.
    pub fn cache_view<T>(&self, load_type: LoadType) -> CacheViewService<T>
    where
        T: Serialize + DeserializeOwned,
    {
        CacheViewService::new(
            load_type,
            self.stores.cache.clone(),
            self.stores.pointers.clone(),
            self.scheduler.clone(),
            self.clock.clone(),
        )
    }

    pub fn register_loader(mut self, load_type: LoadType, loader: impl Loader + 'static) -> Self {
        self.loaders.register(load_type, loader);
        self
    }

    /// Register a typed loader; its results are saved through the type's cache view.
    pub fn register_cache_loader<T, L>(self, load_type: LoadType, loader: L) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
        L: CacheLoader<T> + 'static,
    {
        let view = self.cache_view::<T>(load_type.clone());
        self.register_loader(load_type, CacheLoaderAdapter::new(loader, view))
    }

    pub fn listener_group(mut self, group: ListenerGroup) -> Self {
        self.listener_groups.push(group);
        self
    }

    /// Validate the configuration and start the enabled background components.
    pub fn start(self) -> Result<LoaderRuntime, LoadError> {
        self.config.validate()?;

        let policies = RetryPolicies::from_config(&self.config);
        let notifier: Arc<dyn Notifier> = Arc::new(NotificationFanout::new(
            self.notification_bus.clone(),
            self.topics.clone(),
        ));
        let sweeper = Arc::new(RetrySweeper::new(
            self.stores.status.clone(),
            self.scheduler.clone(),
            notifier.clone(),
            policies.clone(),
            self.clock.clone(),
            self.config.sweep_batch_size,
        ));

        let mut workers = Vec::new();
        if let Err(e) = self.spawn_components(&mut workers, &sweeper, notifier, policies) {
            for handle in workers {
                handle.shutdown();
            }
            return Err(e);
        }

        info!(
            workers = workers.len(),
            load_types = ?self.loaders.load_types().map(LoadType::as_str).collect::<Vec<_>>(),
            listener_groups = self.listener_groups.len(),
            "loader runtime started"
        );

        Ok(LoaderRuntime {
            config: self.config,
            stores: self.stores,
            scheduler: self.scheduler,
            sweeper,
            clock: self.clock,
            workers,
        })
    }

    fn spawn_components(
        &self,
        workers: &mut Vec<WorkerHandle>,
        sweeper: &Arc<RetrySweeper>,
        notifier: Arc<dyn Notifier>,
        policies: RetryPolicies,
    ) -> Result<(), LoadError> {
        if self.config.enable_workers {
            let worker = Arc::new(LoadWorker::new(
                self.stores.status.clone(),
                Arc::new(self.loaders.clone()),
                notifier,
                policies,
                self.clock.clone(),
            ));
            for load_type in self.loaders.load_types() {
                workers.extend(worker.spawn(
                    &self.dispatch_bus,
                    &self.topics,
                    load_type,
                    LOAD_WORKER_GROUP,
                )?);
            }
        }

        if self.config.enable_retry_sweeper {
            workers.push(sweeper.spawn(self.config.sweep_interval));
        }

        if self.config.enable_notifications {
            for group in &self.listener_groups {
                workers.extend(group.clone().spawn(&self.notification_bus, &self.topics)?);
            }
        }

        Ok(())
    }
}

/// A started subsystem; owns its background threads.
pub struct LoaderRuntime {
    config: LoaderConfig,
    stores: LoaderStores,
    scheduler: Arc<dyn LoadScheduler>,
    sweeper: Arc<RetrySweeper>,
    clock: Arc<dyn Clock>,
    workers: Vec<WorkerHandle>,
}

impl LoaderRuntime {
    pub fn builder<DB, NB>(
        config: LoaderConfig,
        stores: LoaderStores,
        dispatch_bus: DB,
        notification_bus: NB,
        clock: Arc<dyn Clock>,
    ) -> LoaderRuntimeBuilder<DB, NB>
    where
        DB: MessageBus<DispatchMessage> + 'static,
        NB: MessageBus<LoadNotification> + 'static,
    {
        LoaderRuntimeBuilder::new(config, stores, dispatch_bus, notification_bus, clock)
    }

    /// Builder over in-memory stores and buses sized by `config.partition_count`.
    ///
    /// For tests and local development: state is lost with the process, the
    /// buses keep only [`loadcache_events::DEFAULT_RETENTION`] messages per
    /// partition for replay, and an unacknowledged message is never delivered
    /// again.
    pub fn in_memory(
        config: LoaderConfig,
        clock: Arc<dyn Clock>,
    ) -> LoaderRuntimeBuilder<InMemoryMessageBus<DispatchMessage>, InMemoryMessageBus<LoadNotification>>
    {
        let partitions = config.partition_count;
        Self::builder(
            config,
            LoaderStores::in_memory(),
            InMemoryMessageBus::new(partitions),
            InMemoryMessageBus::new(partitions),
            clock,
        )
    }

    pub fn cache_view<T>(&self, load_type: LoadType) -> CacheViewService<T>
    where
        T: Serialize + DeserializeOwned,
    {
        CacheViewService::new(
            load_type,
            self.stores.cache.clone(),
            self.stores.pointers.clone(),
            self.scheduler.clone(),
            self.clock.clone(),
        )
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn LoadScheduler> {
        &self.scheduler
    }

    /// The sweeper, for manual `sweep_once` calls (e.g. when the periodic one is disabled).
    pub fn sweeper(&self) -> &Arc<RetrySweeper> {
        &self.sweeper
    }

    pub fn status_store(&self) -> &Arc<dyn TaskStatusStore> {
        &self.stores.status
    }

    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(WorkerHandle::name).collect()
    }

    /// Stop every background thread and wait for them.
    pub fn shutdown(self) {
        let count = self.workers.len();
        for handle in self.workers {
            handle.shutdown();
        }
        info!(workers = count, "loader runtime stopped");
    }
}
