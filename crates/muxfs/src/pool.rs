//! Per-mount backend instance pool.
//!
//! Admission is a FIFO [`Semaphore`] with one permit per allowed instance,
//! so a caller beyond the maximum queues behind earlier callers instead of
//! spinning. Instances are lent out as [`PooledInstance`] guards that hand
//! the instance back when dropped.
//!
//! ```text
//! acquire ──► permit (wait ≤ acquire_timeout)
//!               │
//!               ├── idle instance? ──► lend it
//!               └── none ──► factory.create() ──► lend it
//!
//! drop(PooledInstance) ──► healthy? ──► idle
//!                               └─ no ──► retired (shut down on next acquire/drain)
//! ```

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info, warn};

use crate::error::{VfsError, VfsResult};
use crate::ops::VfsOps;
use crate::registry::InstanceFactory;

/// Default maximum number of live instances per mount.
pub const DEFAULT_MAX_INSTANCES: usize = 10;

/// Default wait for a free instance.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on lent + idle instances.
    pub max_instances: usize,
    /// How long `acquire` waits; `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    /// Idle instances older than this are shut down; `None` keeps them.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: DEFAULT_MAX_INSTANCES,
            acquire_timeout: Some(DEFAULT_ACQUIRE_TIMEOUT),
            idle_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Set the maximum instance count.
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    /// Set the acquisition timeout.
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the idle eviction timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// What unmount does when instances are still lent out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Report `Busy` immediately.
    #[default]
    Fail,
    /// Wait for every lent instance to come back, up to the timeout if set.
    Wait { timeout: Option<Duration> },
}

/// Snapshot of pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub max: usize,
    /// Instances in existence (lent + idle), including ones being built.
    pub live: usize,
    pub idle: usize,
    pub lent: usize,
}

struct IdleInstance {
    instance: Box<dyn VfsOps>,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleInstance>,
    retired: Vec<Box<dyn VfsOps>>,
    live: usize,
}

struct PoolInner {
    mount: String,
    plugin: String,
    config: PoolConfig,
    factory: Arc<dyn InstanceFactory>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

/// Bounded set of backend instances for one mount.
#[derive(Clone)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("mount", &self.inner.mount)
            .field("plugin", &self.inner.plugin)
            .field("stats", &self.stats())
            .finish()
    }
}

impl InstancePool {
    /// Create an empty pool. A maximum of zero is rejected.
    pub fn new(
        mount: impl Into<String>,
        plugin: impl Into<String>,
        factory: Arc<dyn InstanceFactory>,
        config: PoolConfig,
    ) -> VfsResult<Self> {
        let limit = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        if config.max_instances == 0 || config.max_instances > limit {
            return Err(VfsError::invalid_argument(format!(
                "max_instances must be between 1 and {limit}"
            )));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                mount: mount.into(),
                plugin: plugin.into(),
                config,
                factory,
                permits: Arc::new(Semaphore::new(config.max_instances)),
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    /// Build one instance up front and park it as idle.
    ///
    /// Used at mount time so a factory that cannot produce an instance is
    /// reported before the mount becomes visible.
    pub fn prime(&self) -> VfsResult<()> {
        let instance = self.create()?;
        let mut state = self.inner.state.lock();
        state.live += 1;
        state.idle.push_back(IdleInstance {
            instance,
            since: Instant::now(),
        });
        Ok(())
    }

    pub fn mount(&self) -> &str {
        &self.inner.mount
    }

    /// Plugin type the instances are built from.
    pub fn plugin(&self) -> &str {
        &self.inner.plugin
    }

    fn create(&self) -> VfsResult<Box<dyn VfsOps>> {
        self.inner
            .factory
            .create()
            .map_err(|e| VfsError::PluginInitFailed {
                plugin: self.inner.plugin.clone(),
                message: e.to_string(),
            })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow an instance, waiting for one to free up if the pool is at its
    /// maximum.
    pub async fn acquire(&self) -> VfsResult<PooledInstance> {
        let permits = Arc::clone(&self.inner.permits);
        let permit = match self.inner.config.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, permits.acquire_owned())
                .await
                .map_err(|_| VfsError::TimedOut {
                    mount: self.inner.mount.clone(),
                    waited: limit,
                })?,
            None => permits.acquire_owned().await,
        }
        // Closed only once the pool has been drained.
        .map_err(|_| VfsError::NotMounted(self.inner.mount.clone()))?;

        self.reap().await;

        let reused = {
            let mut state = self.inner.state.lock();
            match state.idle.pop_back() {
                Some(idle) => Some(idle.instance),
                None => {
                    // Reserve the slot before calling out so concurrent
                    // creators never overshoot the maximum.
                    state.live += 1;
                    None
                }
            }
        };

        let instance = match reused {
            Some(instance) => instance,
            None => match self.create() {
                Ok(instance) => {
                    debug!(mount = %self.inner.mount, plugin = %self.inner.plugin, "Created backend instance");
                    instance
                }
                Err(e) => {
                    self.inner.state.lock().live -= 1;
                    return Err(e);
                }
            },
        };

        Ok(PooledInstance {
            instance: Some(instance),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Shut down idle instances that outlived the idle timeout.
    pub async fn evict_idle(&self) -> usize {
        let Some(limit) = self.inner.config.idle_timeout else {
            return 0;
        };
        let expired: Vec<Box<dyn VfsOps>> = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| now.duration_since(idle.since) >= limit);
            state.idle = kept;
            state.live -= expired.len();
            expired.into_iter().map(|idle| idle.instance).collect()
        };
        let count = expired.len();
        if count > 0 {
            debug!(mount = %self.inner.mount, count, "Evicting idle instances");
        }
        shutdown_all(&self.inner.mount, expired).await;
        count
    }

    /// Current bookkeeping.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            max: self.inner.config.max_instances,
            live: state.live,
            idle: state.idle.len(),
            lent: state.live - state.idle.len(),
        }
    }

    /// Take every permit so nothing is lent and nothing new can be lent.
    ///
    /// The returned guard either finishes the drain or, when dropped,
    /// puts the pool back into service.
    pub async fn quiesce(&self, policy: DrainPolicy) -> VfsResult<DrainGuard> {
        let permits = Arc::clone(&self.inner.permits);
        let all = self.inner.config.max_instances as u32;
        let held = match policy {
            DrainPolicy::Fail => permits.try_acquire_many_owned(all).map_err(|e| match e {
                TryAcquireError::Closed => VfsError::NotMounted(self.inner.mount.clone()),
                TryAcquireError::NoPermits => VfsError::Busy(format!(
                    "{} has {} instance(s) in use",
                    self.inner.mount,
                    self.stats().lent
                )),
            })?,
            DrainPolicy::Wait { timeout } => {
                let wait = permits.acquire_many_owned(all);
                let acquired = match timeout {
                    Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                        VfsError::Busy(format!(
                            "{} still in use after {:?}",
                            self.inner.mount, limit
                        ))
                    })?,
                    None => wait.await,
                };
                acquired.map_err(|_| VfsError::NotMounted(self.inner.mount.clone()))?
            }
        };
        Ok(DrainGuard {
            pool: self.clone(),
            _held: held,
        })
    }

    /// Drain the pool: wait or fail per `policy`, then shut down every
    /// instance and close the pool for good.
    pub async fn drain(&self, policy: DrainPolicy) -> VfsResult<()> {
        self.quiesce(policy).await?.finish().await;
        Ok(())
    }

    /// Shut down retired instances and, if configured, expired idle ones.
    async fn reap(&self) {
        let retired = std::mem::take(&mut self.inner.state.lock().retired);
        shutdown_all(&self.inner.mount, retired).await;
        self.evict_idle().await;
    }
}

/// Exclusive hold on a quiesced pool.
pub struct DrainGuard {
    pool: InstancePool,
    _held: OwnedSemaphorePermit,
}

impl DrainGuard {
    /// Close the pool and shut down every remaining instance.
    pub async fn finish(self) {
        let inner = &self.pool.inner;
        inner.permits.close();
        let instances: Vec<Box<dyn VfsOps>> = {
            let mut state = inner.state.lock();
            let mut all: Vec<_> = state.idle.drain(..).map(|idle| idle.instance).collect();
            all.append(&mut state.retired);
            state.live = 0;
            all
        };
        info!(mount = %inner.mount, count = instances.len(), "Draining instance pool");
        shutdown_all(&inner.mount, instances).await;
    }
}

async fn shutdown_all(mount: &str, instances: Vec<Box<dyn VfsOps>>) {
    for instance in instances {
        if let Err(e) = instance.shutdown().await {
            warn!(mount = %mount, error = %e, "Backend shutdown failed");
        }
    }
}

/// An instance on loan from a pool. Returned when dropped.
pub struct PooledInstance {
    instance: Option<Box<dyn VfsOps>>,
    pool: Arc<PoolInner>,
    // Released after `drop` has put the instance back.
    _permit: OwnedSemaphorePermit,
}

impl PooledInstance {
    /// Path of the mount this instance serves.
    pub fn mount(&self) -> &str {
        &self.pool.mount
    }
}

impl Deref for PooledInstance {
    type Target = dyn VfsOps;

    fn deref(&self) -> &Self::Target {
        self.instance
            .as_deref()
            .expect("instance present until drop")
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        let mut state = self.pool.state.lock();
        if instance.is_healthy() {
            state.idle.push_back(IdleInstance {
                instance,
                since: Instant::now(),
            });
        } else {
            warn!(mount = %self.pool.mount, "Retiring unhealthy backend instance");
            state.live -= 1;
            state.retired.push(instance);
        }
    }
}
