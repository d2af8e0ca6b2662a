//! Component wiring shared by the binaries.
//!
//! Builds store, queue and availability adapters for the configured storage
//! backend, constructs inference backends from their config sections, and
//! runs the in-process worker set used when `storage.backend = "memory"`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admission::AdmissionService;
use crate::availability::{spawn_heartbeat, AvailabilityFlag, BackendAvailability};
use crate::backend::{EchoBackend, InferenceBackend, LocalGpuBackend, RemoteApiBackend};
use crate::config::{BackendProvider, BackendSection, ServiceConfig, StorageBackend};
use crate::job::BackendKind;
use crate::queue::{InMemoryQueue, WorkQueue};
use crate::store::{InMemoryJobStore, JobStore};
use crate::worker::JobWorker;
use crate::DispatchError;

/// How often the embedded store drops expired records.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Store, queue and availability adapters for one process.
#[derive(Clone)]
pub struct Components {
    /// Job status store.
    pub store: Arc<dyn JobStore>,
    /// Work queue.
    pub queue: Arc<dyn WorkQueue>,
    /// GPU liveness source.
    pub availability: Arc<dyn BackendAvailability>,
    /// Set when the store lives in this process.
    memory_store: Option<Arc<InMemoryJobStore>>,
}

impl std::fmt::Debug for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Components")
            .field("in_process", &self.is_in_process())
            .finish_non_exhaustive()
    }
}

impl Components {
    /// Build adapters for `config.storage.backend`.
    ///
    /// `consumer_id` names this process's Redis processing lists and its
    /// heartbeat entry.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] if Redis storage is configured but
    /// the crate was built without the `distributed` feature, or if a Redis
    /// client cannot be opened.
    pub fn build(config: &ServiceConfig, consumer_id: &str) -> Result<Self, DispatchError> {
        match config.storage.backend {
            StorageBackend::Memory => Ok(Self::in_memory(config)),
            StorageBackend::Redis => Self::redis(config, consumer_id),
        }
    }

    /// Single-process adapters. GPU availability starts `false` until a
    /// heartbeat reports otherwise.
    pub fn in_memory(config: &ServiceConfig) -> Self {
        let store = Arc::new(InMemoryJobStore::with_retention(config.retention.policy()));
        Self {
            store: store.clone(),
            queue: Arc::new(InMemoryQueue::new()),
            availability: Arc::new(AvailabilityFlag::new(false)),
            memory_store: Some(store),
        }
    }

    #[cfg(feature = "distributed")]
    fn redis(config: &ServiceConfig, consumer_id: &str) -> Result<Self, DispatchError> {
        use crate::availability::RedisAvailability;
        use crate::queue::RedisQueue;
        use crate::store::RedisJobStore;

        let storage = &config.storage;
        let client = redis::Client::open(storage.redis_url.as_str())
            .map_err(|e| DispatchError::Config(format!("invalid redis_url: {e}")))?;
        let client = Arc::new(client);
        let ttl = Duration::from_secs(config.workers.availability_ttl_s);

        info!(prefix = %storage.key_prefix, consumer_id, "using redis storage");
        Ok(Self {
            store: Arc::new(RedisJobStore::from_client(
                client.clone(),
                storage.key_prefix.clone(),
                config.retention.policy(),
            )),
            queue: Arc::new(RedisQueue::from_client(
                client.clone(),
                storage.key_prefix.clone(),
                consumer_id,
            )),
            availability: Arc::new(RedisAvailability::from_client(
                client,
                &storage.key_prefix,
                ttl,
            )),
            memory_store: None,
        })
    }

    #[cfg(not(feature = "distributed"))]
    fn redis(_config: &ServiceConfig, _consumer_id: &str) -> Result<Self, DispatchError> {
        Err(DispatchError::Config(
            "storage.backend = \"redis\" requires the 'distributed' feature".into(),
        ))
    }

    /// Whether store and queue live in this process.
    pub fn is_in_process(&self) -> bool {
        self.memory_store.is_some()
    }

    /// Admission service over these adapters.
    pub fn admission(&self, config: &ServiceConfig) -> AdmissionService {
        AdmissionService::new(
            self.store.clone(),
            self.queue.clone(),
            self.availability.clone(),
            config.queues.clone(),
        )
    }

    /// Worker for `kind` over these adapters.
    pub fn worker(
        &self,
        config: &ServiceConfig,
        kind: BackendKind,
        worker_id: impl Into<String>,
        backend: Arc<dyn InferenceBackend>,
    ) -> JobWorker {
        JobWorker::new(
            kind,
            worker_id,
            self.store.clone(),
            self.queue.clone(),
            backend,
        )
        .with_settings(&config.workers)
        .with_queues(config.queues.clone())
    }
}

/// Construct the inference client described by `section`.
///
/// # Errors
///
/// Returns [`DispatchError::Config`] if an `open_ai_compatible` backend's key
/// variable is unset.
pub fn build_backend(
    section: &BackendSection,
    timeout: Duration,
) -> Result<Arc<dyn InferenceBackend>, DispatchError> {
    let backend: Arc<dyn InferenceBackend> = match section.provider {
        BackendProvider::Echo => Arc::new(EchoBackend::new()),
        BackendProvider::LocalServer => {
            let mut local = LocalGpuBackend::new()
                .with_model(section.model.clone())
                .with_timeout(timeout)
                .with_probe_timeout(Duration::from_millis(section.probe_timeout_ms));
            if let Some(url) = &section.url {
                local = local.with_url(url.clone());
            }
            Arc::new(local)
        }
        BackendProvider::OpenAiCompatible => {
            let key_var = section.api_key_env.as_deref().unwrap_or("NVIDIA_API_KEY");
            let mut remote =
                RemoteApiBackend::from_env(key_var, section.model.clone())?.with_timeout(timeout);
            if let Some(url) = &section.url {
                remote = remote.with_base_url(url.clone());
            }
            Arc::new(remote)
        }
    };
    debug!(provider = ?section.provider, model = %section.model, "backend built");
    Ok(backend)
}

/// Id for this process: `storage.consumer_id`, else `$HOSTNAME`.
///
/// Redis consumers own a processing list named after this id, and only a
/// process restarting under the same id recovers it, so the redis backend
/// refuses to run without one. In-memory storage falls back to a random id.
///
/// # Errors
/// `DispatchError::Config` for the redis backend when neither source is set.
pub fn consumer_id(config: &ServiceConfig) -> Result<String, DispatchError> {
    resolve_consumer_id(config, std::env::var("HOSTNAME").ok())
}

fn resolve_consumer_id(
    config: &ServiceConfig,
    hostname: Option<String>,
) -> Result<String, DispatchError> {
    let stable = config
        .storage
        .consumer_id
        .clone()
        .or(hostname)
        .filter(|id| !id.trim().is_empty());
    match (stable, config.storage.backend) {
        (Some(id), _) => Ok(id),
        (None, StorageBackend::Memory) => Ok(format!("dispatch-{}", uuid::Uuid::new_v4())),
        (None, StorageBackend::Redis) => Err(DispatchError::Config(
            "storage.consumer_id (or HOSTNAME) must be set for the redis backend; \
             unacknowledged deliveries are recovered by consumer id"
                .into(),
        )),
    }
}

/// Handles for workers running inside the API process.
#[derive(Debug)]
pub struct EmbeddedWorkers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl EmbeddedWorkers {
    /// Start GPU and API worker pools, the GPU heartbeat and, for the
    /// in-memory store, the expiry sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Config`] if a backend cannot be built.
    pub fn spawn(
        config: &ServiceConfig,
        components: &Components,
        worker_id: &str,
    ) -> Result<Self, DispatchError> {
        let gpu_backend = build_backend(
            &config.backends.gpu,
            config.workers.timeout_for(BackendKind::Gpu),
        )?;
        let api_backend = build_backend(
            &config.backends.api,
            config.workers.timeout_for(BackendKind::Api),
        )?;
        Ok(Self::spawn_with_backends(
            config,
            components,
            worker_id,
            gpu_backend,
            api_backend,
        ))
    }

    /// As [`EmbeddedWorkers::spawn`] with caller-supplied backends.
    pub fn spawn_with_backends(
        config: &ServiceConfig,
        components: &Components,
        worker_id: &str,
        gpu_backend: Arc<dyn InferenceBackend>,
        api_backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::new();

        handles.push(spawn_heartbeat(
            components.availability.clone(),
            gpu_backend.clone(),
            worker_id.to_string(),
            Duration::from_secs(config.workers.heartbeat_interval_s),
            rx.clone(),
        ));

        for (kind, backend) in [(BackendKind::Gpu, gpu_backend), (BackendKind::Api, api_backend)] {
            let worker = Arc::new(components.worker(config, kind, worker_id, backend));
            handles.extend(worker.spawn_pool(config.workers.concurrency_for(kind), rx.clone()));
        }

        if let Some(store) = &components.memory_store {
            handles.push(spawn_purge(store.clone(), PURGE_INTERVAL, rx));
        }

        info!(tasks = handles.len(), "embedded workers started");
        Self { shutdown, handles }
    }

    /// Signal every task and wait for it to finish.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            warn!("embedded workers already stopped");
        }
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "embedded task ended abnormally");
            }
        }
        info!("embedded workers stopped");
    }
}

fn spawn_purge(
    store: Arc<InMemoryJobStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        debug!(purged, "expired entries purged");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
