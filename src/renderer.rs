//! Renderer contract and the pooled, time-bounded render session

use crate::{Launcher, PoolStats, RenderError, RenderRequest, RendererConfig, RendererPool};
use async_trait::async_trait;
use bytes::Bytes;
use image::ImageFormat;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// JPEG bytes produced by a render. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    bytes: Bytes,
}

impl RenderedImage {
    /// Wraps captured bytes, rejecting anything that is not a JPEG.
    pub fn from_jpeg(data: impl Into<Bytes>) -> Result<Self, RenderError> {
        let bytes = data.into();
        match image::guess_format(&bytes) {
            Ok(ImageFormat::Jpeg) => Ok(Self { bytes }),
            Ok(other) => Err(RenderError::Capture(format!(
                "expected JPEG output, got {other:?}"
            ))),
            Err(e) => Err(RenderError::Capture(format!(
                "unrecognised capture output ({} bytes): {e}",
                bytes.len()
            ))),
        }
    }

    pub fn new_unchecked(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn content_length(&self) -> usize {
        self.bytes.len()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Per-capture knobs handed to an engine.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub navigation_timeout: Duration,
    pub network_idle_connections: usize,
    pub network_idle_time: Duration,
}

impl From<&RendererConfig> for CaptureOptions {
    fn from(config: &RendererConfig) -> Self {
        Self {
            navigation_timeout: config.navigation_timeout,
            network_idle_connections: config.network_idle_connections,
            network_idle_time: config.network_idle_time,
        }
    }
}

/// Turns a validated request into JPEG bytes.
///
/// Implementations own engine lifecycle: whatever they acquire for a call is
/// released before the call returns or is dropped.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedImage, RenderError>;

    fn stats(&self) -> Option<PoolStats> {
        None
    }
}

/// Renderer that leases engines from a [`RendererPool`]
///
/// The whole session, from checkout to capture, is bounded by
/// `session_timeout`. A timed-out session drops its lease, which closes the
/// engine in the background.
pub struct PooledRenderer<L: Launcher> {
    pool: Arc<RendererPool<L>>,
    options: CaptureOptions,
    session_timeout: Duration,
}

impl<L: Launcher> PooledRenderer<L> {
    pub fn new(pool: Arc<RendererPool<L>>, options: CaptureOptions, session_timeout: Duration) -> Self {
        Self {
            pool,
            options,
            session_timeout,
        }
    }

    pub fn from_config(pool: Arc<RendererPool<L>>, config: &RendererConfig) -> Self {
        Self::new(pool, CaptureOptions::from(config), config.launch_timeout)
    }

    pub fn pool(&self) -> &Arc<RendererPool<L>> {
        &self.pool
    }
}

#[async_trait]
impl<L: Launcher> Renderer for PooledRenderer<L> {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedImage, RenderError> {
        let session = async {
            let mut lease = self.pool.checkout().await?;
            debug!(engine = lease.engine_id(), "Engine checked out for {}", request.url());

            let result = lease.capture(request, &self.options).await;
            lease.release(result.is_ok()).await;
            result
        };

        timeout(self.session_timeout, session)
            .await
            .unwrap_or(Err(RenderError::Timeout {
                stage: "render session",
                after: self.session_timeout,
            }))
    }

    fn stats(&self) -> Option<PoolStats> {
        Some(self.pool.stats())
    }
}
