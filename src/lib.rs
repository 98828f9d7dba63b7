//! # Screenshot Server
//!
//! An HTTP service that renders web pages to JPEG with headless Chrome and
//! caches every render in S3-compatible object storage.
//!
//! A request such as `GET /?url=https://example.com&size=1280x720&quality=85`
//! is validated, mapped to a deterministic cache key
//! (`screenshots/example.com_1280x720_q85.jpg`) and served from the bucket
//! when present. On a miss an engine is leased from a bounded browser pool,
//! the page is loaded until the network is idle, the viewport is captured and
//! returned, and the object is written back in the background.
//!
//! ## Request parameters
//!
//! | Parameter | Default | Bounds |
//! |-----------|---------|--------|
//! | `url` | required | absolute `http`/`https` |
//! | `width` | 1280 | 100 to 4096 |
//! | `height` | 720 | 100 to 4096 |
//! | `size` | none | `WIDTHxHEIGHT`, overrides width/height |
//! | `quality` | 85 | 1 to 100 |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use screenshot_server::{MemoryBlobStore, Metrics, ScreenshotQuery, ScreenshotService};
//! use screenshot_server::{ChromeLauncher, PoolSettings, PooledRenderer, RendererConfig, RendererPool};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RendererConfig::default();
//!     let metrics = Arc::new(Metrics::noop());
//!     let pool = Arc::new(RendererPool::new(
//!         ChromeLauncher::new(config.clone()),
//!         PoolSettings::from(&config),
//!         metrics.clone(),
//!     ));
//!     let renderer = Arc::new(PooledRenderer::from_config(pool.clone(), &config));
//!     let service = ScreenshotService::new(Arc::new(MemoryBlobStore::new()), renderer, metrics);
//!
//!     let shot = service.screenshot(&ScreenshotQuery::for_url("https://example.com")).await?;
//!     println!("{} ({:?})", shot.key, shot.source);
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # Serve on $PORT (default 3000)
//! screenshot-server serve
//!
//! # One-off capture through the cache
//! screenshot-server capture --url https://example.com --size 800x600 --output shot.jpg
//!
//! # Show the cache key for a request
//! screenshot-server key --url https://example.com --quality 70
//! ```

/// Configuration and settings for the server
pub mod config;

/// Error types and their HTTP mapping
pub mod error;

/// Query validation into render requests
pub mod request;

/// Deterministic object keys for cached screenshots
pub mod cache_key;

/// Blob store contract and the in-memory store
pub mod store;

/// S3-compatible blob store
pub mod s3_store;

/// Renderer contract and the pooled renderer
pub mod renderer;

/// Bounded pool of browser engines
pub mod browser_pool;

/// Headless Chrome engine
pub mod chrome;

/// Cache-aside orchestration for a single request
pub mod screenshot_service;

/// Per-client rate limiting
pub mod rate_limit;

/// HTTP router and serve loop
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Prometheus metrics
pub mod metrics;

/// Health reporting for the service and its engine pool
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod test_support;


pub use browser_pool::*;
pub use cache_key::*;
pub use chrome::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use metrics::*;
pub use rate_limit::*;
pub use renderer::*;
pub use request::*;
pub use s3_store::*;
pub use screenshot_service::*;
pub use store::*;
