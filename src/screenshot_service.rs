//! Cache-aside orchestration: look up, render on miss, persist in the background

use crate::utils::{format_bytes, format_duration};
use crate::{
    BlobStore, ByteStream, CacheKey, Metrics, PoolStats, RenderError, RenderRequest,
    RenderedImage, Renderer, ScreenshotQuery, ServiceError,
};
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CACHE_CONTROL: &str = "public, max-age=86400";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenshotSource {
    Cache,
    Render,
}

impl ScreenshotSource {
    pub fn as_header(&self) -> &'static str {
        match self {
            ScreenshotSource::Cache => "HIT",
            ScreenshotSource::Render => "MISS",
        }
    }
}

pub enum ScreenshotBody {
    /// Streamed straight from the store
    Stream(ByteStream),
    /// Freshly rendered
    Bytes(Bytes),
}

/// A screenshot ready to be sent to the client.
pub struct Screenshot {
    pub key: CacheKey,
    pub source: ScreenshotSource,
    pub content_length: Option<u64>,
    pub body: ScreenshotBody,
    /// Background write of a fresh render; `None` on cache hits.
    pub persist: Option<JoinHandle<()>>,
}

impl Screenshot {
    /// Buffers the whole body, mostly for the CLI and tests.
    pub async fn into_bytes(self) -> Result<Bytes, crate::StoreError> {
        match self.body {
            ScreenshotBody::Bytes(bytes) => Ok(bytes),
            ScreenshotBody::Stream(body) => {
                crate::StoredObject {
                    content_length: self.content_length,
                    body,
                }
                .collect()
                .await
            }
        }
    }
}

impl std::fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Screenshot")
            .field("key", &self.key)
            .field("source", &self.source)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl IntoResponse for Screenshot {
    fn into_response(self) -> Response {
        let body = match self.body {
            ScreenshotBody::Stream(stream) => Body::from_stream(stream),
            ScreenshotBody::Bytes(bytes) => Body::from(bytes),
        };

        let mut response = (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, CACHE_CONTROL),
            ],
            body,
        )
            .into_response();

        let headers = response.headers_mut();
        headers.insert("x-cache", HeaderValue::from_static(self.source.as_header()));
        if let Some(len) = self.content_length {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        response
    }
}

pub struct ScreenshotService {
    store: Arc<dyn BlobStore>,
    renderer: Arc<dyn Renderer>,
    metrics: Arc<Metrics>,
}

impl ScreenshotService {
    pub fn new(store: Arc<dyn BlobStore>, renderer: Arc<dyn Renderer>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            renderer,
            metrics,
        }
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn renderer_stats(&self) -> Option<PoolStats> {
        self.renderer.stats()
    }

    /// Validates raw query parameters and serves the screenshot.
    ///
    /// Invalid input is rejected before the store or renderer is touched.
    pub async fn screenshot(&self, query: &ScreenshotQuery) -> Result<Screenshot, ServiceError> {
        let request = RenderRequest::from_query(query).map_err(|e| {
            self.metrics.record_invalid_request();
            debug!("Rejected screenshot request: {}", e);
            e
        })?;

        Ok(self.serve(request).await?)
    }

    /// Serves a validated request from cache, rendering on a miss.
    ///
    /// A failed store read is treated as a miss. The store write after a
    /// render is detached and never delays or fails the response.
    pub async fn serve(&self, request: RenderRequest) -> Result<Screenshot, RenderError> {
        let key = CacheKey::for_request(&request);
        let span = info_span!("screenshot", request_id = %Uuid::new_v4(), key = %key);

        async move {
            match self.store.get(&key).await {
                Ok(Some(object)) => {
                    self.metrics.record_cache_lookup(true);
                    info!("Cache hit for {}", request.url());
                    return Ok(Screenshot {
                        key,
                        source: ScreenshotSource::Cache,
                        content_length: object.content_length,
                        body: ScreenshotBody::Stream(object.body),
                        persist: None,
                    });
                }
                Ok(None) => debug!("Cache miss"),
                Err(e) => {
                    self.metrics.record_store_error(false);
                    warn!("Cache lookup failed, rendering instead: {}", e);
                }
            }
            self.metrics.record_cache_lookup(false);

            let started = Instant::now();
            let image = match self.renderer.render(&request).await {
                Ok(image) => image,
                Err(e) => {
                    self.metrics.record_render(started.elapsed(), Some(e.kind()));
                    error!(kind = e.kind(), "Render failed for {}: {}", request.url(), e);
                    return Err(e);
                }
            };

            let elapsed = started.elapsed();
            self.metrics.record_render(elapsed, None);
            info!(
                "Rendered {} ({}) in {}",
                request.url(),
                format_bytes(image.content_length()),
                format_duration(elapsed)
            );

            let persist = self.spawn_persist(key.clone(), image.clone());
            Ok(Screenshot {
                key,
                source: ScreenshotSource::Render,
                content_length: Some(image.content_length() as u64),
                body: ScreenshotBody::Bytes(image.into_bytes()),
                persist: Some(persist),
            })
        }
        .instrument(span)
        .await
    }

    fn spawn_persist(&self, key: CacheKey, image: RenderedImage) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);

        tokio::spawn(
            async move {
                match store.put(&key, &image).await {
                    Ok(()) => debug!("Stored {}", key),
                    Err(e) => {
                        metrics.record_store_error(true);
                        warn!("Failed to store {}: {}", key, e);
                    }
                }
            }
            .in_current_span(),
        )
    }
}
