//! Bounded pool of rendering engines
//!
//! The pool is created once at process start and shut down at exit. Engines
//! are leased for a single render; a lease hands its engine back (or closes
//! it) on every exit path, including cancellation.

use crate::{CaptureOptions, Metrics, RenderError, RenderRequest, RenderedImage, RendererConfig};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// A single rendering engine instance (one browser process).
#[async_trait]
pub trait Engine: Send + 'static {
    /// Loads the request URL in a fresh page and captures the viewport.
    async fn capture(
        &mut self,
        request: &RenderRequest,
        options: &CaptureOptions,
    ) -> Result<RenderedImage, RenderError>;

    /// False once the engine's connection or process has gone away
    fn is_alive(&self) -> bool;

    /// Releases the engine's process and any on-disk state.
    async fn close(self);
}

/// Starts new engines for the pool.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    type Engine: Engine;

    async fn launch(&self) -> Result<Self::Engine, RenderError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Maximum engines checked out at the same time
    pub max_active: usize,
    /// Engines kept warm between leases
    pub max_idle: usize,
    /// Renders before an engine is recycled
    pub max_uses: usize,
}

impl From<&RendererConfig> for PoolSettings {
    fn from(config: &RendererConfig) -> Self {
        Self {
            max_active: config.pool_size,
            max_idle: config.max_idle.min(config.pool_size),
            max_uses: config.max_engine_uses,
        }
    }
}

struct PooledEngine<E> {
    id: usize,
    engine: E,
    uses: usize,
    created_at: Instant,
    last_used: Instant,
}

pub struct RendererPool<L: Launcher> {
    launcher: L,
    settings: PoolSettings,
    idle: Mutex<Vec<PooledEngine<L::Engine>>>,
    permits: Arc<Semaphore>,
    metrics: Arc<Metrics>,
    next_id: AtomicUsize,
    launched: AtomicUsize,
    closed: AtomicUsize,
    checkouts: AtomicUsize,
    idle_count: AtomicUsize,
    is_shutting_down: AtomicBool,
}

impl<L: Launcher> RendererPool<L> {
    pub fn new(launcher: L, settings: PoolSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            launcher,
            permits: Arc::new(Semaphore::new(settings.max_active)),
            settings,
            idle: Mutex::new(Vec::new()),
            metrics,
            next_id: AtomicUsize::new(0),
            launched: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            checkouts: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            is_shutting_down: AtomicBool::new(false),
        }
    }

    /// Leases an engine, reusing an idle one when possible.
    ///
    /// Waits while `max_active` engines are already checked out.
    pub async fn checkout(self: &Arc<Self>) -> Result<EngineLease<L>, RenderError> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(RenderError::PoolClosed);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RenderError::PoolClosed)?;

        let pooled = loop {
            let candidate = {
                let mut idle = self.idle.lock().await;
                let candidate = idle.pop();
                self.idle_count.store(idle.len(), Ordering::Relaxed);
                candidate
            };

            match candidate {
                Some(pooled) if pooled.engine.is_alive() => break pooled,
                Some(pooled) => self.discard(pooled, "engine died while idle").await,
                None => break self.launch().await?,
            }
        };

        self.checkouts.fetch_add(1, Ordering::Relaxed);
        Ok(EngineLease {
            pool: Arc::clone(self),
            engine: Some(pooled),
            permit: Some(permit),
        })
    }

    async fn launch(&self) -> Result<PooledEngine<L::Engine>, RenderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let engine = self.launcher.launch().await.map_err(|e| {
            warn!("Failed to launch engine {}: {}", id, e);
            e
        })?;

        self.launched.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_engine_launched();
        debug!("Engine {} launched in {:?}", id, started.elapsed());

        let now = Instant::now();
        Ok(PooledEngine {
            id,
            engine,
            uses: 0,
            created_at: now,
            last_used: now,
        })
    }

    async fn checkin(&self, mut pooled: PooledEngine<L::Engine>, healthy: bool) {
        pooled.uses += 1;
        pooled.last_used = Instant::now();

        let reusable =
            healthy && pooled.engine.is_alive() && pooled.uses < self.settings.max_uses;

        let rejected = if reusable {
            let mut idle = self.idle.lock().await;
            if !self.is_shutting_down.load(Ordering::Acquire) && idle.len() < self.settings.max_idle {
                idle.push(pooled);
                self.idle_count.store(idle.len(), Ordering::Relaxed);
                None
            } else {
                Some((pooled, "pool full"))
            }
        } else if !healthy {
            Some((pooled, "render failed"))
        } else {
            Some((pooled, "engine retired"))
        };

        if let Some((pooled, reason)) = rejected {
            self.discard(pooled, reason).await;
        }
    }

    async fn discard(&self, pooled: PooledEngine<L::Engine>, reason: &str) {
        debug!(
            "Closing engine {} ({}): uses={}, age={:?}",
            pooled.id,
            reason,
            pooled.uses,
            pooled.created_at.elapsed()
        );
        pooled.engine.close().await;
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_engine_closed();
    }

    /// Stops new checkouts and closes every idle engine.
    ///
    /// Engines still leased are closed when their lease ends.
    pub async fn shutdown(&self) {
        info!("Shutting down renderer pool...");
        self.is_shutting_down.store(true, Ordering::Release);
        self.permits.close();

        let drained: Vec<_> = {
            let mut idle = self.idle.lock().await;
            self.idle_count.store(0, Ordering::Relaxed);
            idle.drain(..).collect()
        };

        for pooled in drained {
            self.discard(pooled, "shutdown").await;
        }

        info!("Renderer pool shutdown complete");
    }

    pub fn stats(&self) -> PoolStats {
        let available = if self.is_shutting_down.load(Ordering::Acquire) {
            0
        } else {
            self.permits.available_permits()
        };

        PoolStats {
            max_active: self.settings.max_active,
            active: self.settings.max_active.saturating_sub(self.permits.available_permits()),
            available,
            idle: self.idle_count.load(Ordering::Relaxed),
            launched: self.launched.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            checkouts: self.checkouts.load(Ordering::Relaxed),
            shutting_down: self.is_shutting_down.load(Ordering::Acquire),
        }
    }
}

/// Scoped checkout of one engine
///
/// Call [`EngineLease::release`] when done. A lease dropped without release
/// (caller cancelled, panic) closes its engine on a background task and
/// keeps its pool slot until the close has finished.
pub struct EngineLease<L: Launcher> {
    pool: Arc<RendererPool<L>>,
    engine: Option<PooledEngine<L::Engine>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<L: Launcher> EngineLease<L> {
    pub fn engine_id(&self) -> Option<usize> {
        self.engine.as_ref().map(|p| p.id)
    }

    pub async fn capture(
        &mut self,
        request: &RenderRequest,
        options: &CaptureOptions,
    ) -> Result<RenderedImage, RenderError> {
        match self.engine.as_mut() {
            Some(pooled) => pooled.engine.capture(request, options).await,
            None => Err(RenderError::PoolClosed),
        }
    }

    /// Returns a healthy engine to the pool, or closes it.
    pub async fn release(mut self, healthy: bool) {
        if let Some(pooled) = self.engine.take() {
            self.pool.checkin(pooled, healthy).await;
        }
        self.permit.take();
    }
}

impl<L: Launcher> Drop for EngineLease<L> {
    fn drop(&mut self) {
        let Some(pooled) = self.engine.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let permit = self.permit.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.discard(pooled, "lease dropped").await;
                    drop(permit);
                });
            }
            Err(_) => warn!("Engine {} dropped outside a runtime; not closed", pooled.id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_active: usize,
    pub active: usize,
    pub available: usize,
    pub idle: usize,
    pub launched: usize,
    pub closed: usize,
    pub checkouts: usize,
    pub shutting_down: bool,
}

/// How long an idle engine may sit unused before a sweep closes it
pub const IDLE_ENGINE_TTL: Duration = Duration::from_secs(300);

impl<L: Launcher> RendererPool<L> {
    /// Closes engines idle for longer than `ttl`, returning how many were closed.
    pub async fn sweep_idle(&self, ttl: Duration) -> usize {
        let expired: Vec<_> = {
            let mut idle = self.idle.lock().await;
            let (expired, keep): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|p| p.last_used.elapsed() > ttl || !p.engine.is_alive());
            *idle = keep;
            self.idle_count.store(idle.len(), Ordering::Relaxed);
            expired
        };

        let count = expired.len();
        for pooled in expired {
            self.discard(pooled, "idle sweep").await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{wait_until, FakeLauncher};

    fn pool(launcher: FakeLauncher, max_active: usize, max_idle: usize, max_uses: usize) -> Arc<RendererPool<FakeLauncher>> {
        Arc::new(RendererPool::new(
            launcher,
            PoolSettings {
                max_active,
                max_idle,
                max_uses,
            },
            Arc::new(Metrics::noop()),
        ))
    }

    #[tokio::test]
    async fn test_idle_engine_is_reused() {
        let launcher = FakeLauncher::new();
        let pool = pool(launcher.clone(), 2, 1, 10);

        let lease = pool.checkout().await.unwrap();
        let first_id = lease.engine_id();
        lease.release(true).await;

        let lease = pool.checkout().await.unwrap();
        assert_eq!(lease.engine_id(), first_id);
        lease.release(true).await;

        assert_eq!(launcher.launched(), 1);
        assert_eq!(pool.stats().checkouts, 2);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_engine_retired_after_max_uses() {
        let launcher = FakeLauncher::new();
        let pool = pool(launcher.clone(), 1, 1, 2);

        for _ in 0..4 {
            pool.checkout().await.unwrap().release(true).await;
        }

        assert_eq!(launcher.launched(), 2);
        assert_eq!(launcher.closed(), 2);
    }

    #[tokio::test]
    async fn test_checkout_waits_for_free_slot() {
        let launcher = FakeLauncher::new();
        let pool = pool(launcher.clone(), 1, 1, 10);

        let held = pool.checkout().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|l| l.engine_id()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.stats().active, 1);

        held.release(true).await;
        let id = waiter.await.unwrap().unwrap();
        assert_eq!(id, Some(0));
    }

    #[tokio::test]
    async fn test_dead_idle_engine_replaced() {
        let launcher = FakeLauncher::new();
        let pool = pool(launcher.clone(), 1, 1, 10);

        pool.checkout().await.unwrap().release(true).await;
        launcher.kill_all();

        let lease = pool.checkout().await.unwrap();
        assert_eq!(lease.engine_id(), Some(1));
        lease.release(true).await;
        assert_eq!(launcher.closed(), 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_closes_engine() {
        let launcher = FakeLauncher::new();
        let pool = pool(launcher.clone(), 1, 1, 10);

        drop(pool.checkout().await.unwrap());

        wait_until(|| launcher.closed() == 1).await;
        wait_until(|| pool.stats().active == 0).await;
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_launch_failure_frees_slot() {
        let launcher = FakeLauncher::new();
        launcher.fail_launch(true);
        let pool = pool(launcher.clone(), 1, 1, 10);

        assert!(matches!(pool.checkout().await, Err(RenderError::Launch(_))));
        assert_eq!(pool.stats().active, 0);

        launcher.fail_launch(false);
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_and_rejects_checkout() {
        let launcher = FakeLauncher::new();
        let pool = pool(launcher.clone(), 2, 2, 10);

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        a.release(true).await;

        pool.shutdown().await;
        assert_eq!(launcher.closed(), 1);
        assert!(matches!(pool.checkout().await, Err(RenderError::PoolClosed)));

        // Still-leased engine is closed, not parked, once it comes back.
        b.release(true).await;
        assert_eq!(launcher.closed(), 2);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_sweep_idle_closes_expired() {
        let launcher = FakeLauncher::new();
        let pool = pool(launcher.clone(), 2, 2, 10);

        pool.checkout().await.unwrap().release(true).await;
        assert_eq!(pool.sweep_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(pool.sweep_idle(Duration::ZERO).await, 1);
        assert_eq!(launcher.closed(), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_sweep_idle_keeps_recently_used_engine() {
        let launcher = FakeLauncher::new();
        let pool = pool(launcher.clone(), 1, 1, 10);
        let ttl = Duration::from_millis(100);

        pool.checkout().await.unwrap().release(true).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Older than the ttl, but just used again.
        pool.checkout().await.unwrap().release(true).await;
        assert_eq!(pool.sweep_idle(ttl).await, 0);
        assert_eq!(launcher.launched(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.sweep_idle(ttl).await, 1);
        assert_eq!(launcher.closed(), 1);
    }
}
