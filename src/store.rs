//! Blob store contract for cached screenshots
//!
//! The read path always yields a byte stream, whatever the backend, so the
//! HTTP layer never has to inspect what kind of body it was handed.

use crate::{CacheKey, RenderedImage, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};

pub type ByteStream = BoxStream<'static, Result<Bytes, StoreError>>;

/// A cached object returned by [`BlobStore::get`].
pub struct StoredObject {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl StoredObject {
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            content_length: Some(data.len() as u64),
            body: stream::once(async move { Ok(data) }).boxed(),
        }
    }

    /// Drains the stream into a single buffer.
    pub async fn collect(mut self) -> Result<Bytes, StoreError> {
        let mut buf = Vec::with_capacity(self.content_length.unwrap_or(0) as usize);
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

impl std::fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredObject")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Object storage holding rendered screenshots
///
/// `get` returns `Ok(None)` for a key that was never written; that is the
/// expected miss, not an error. Implementations hold no per-call state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<StoredObject>, StoreError>;

    async fn put(&self, key: &CacheKey, image: &RenderedImage) -> Result<(), StoreError>;

    /// Backend name for logs and health output
    fn name(&self) -> &'static str;
}

/// Process-local store for development and tests
///
/// Whole objects are swapped in atomically, so concurrent writers to the same
/// key leave exactly one complete object behind.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Bytes>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.objects.contains_key(key.as_str())
    }

    pub fn object(&self, key: &CacheKey) -> Option<Bytes> {
        self.objects.get(key.as_str()).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<StoredObject>, StoreError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.object(key).map(StoredObject::from_bytes))
    }

    async fn put(&self, key: &CacheKey, image: &RenderedImage) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(key.to_string(), image.bytes().clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RenderRequest;

    fn key() -> CacheKey {
        CacheKey::for_request(&RenderRequest::new("https://example.com", 1280, 720, 85).unwrap())
    }

    #[tokio::test]
    async fn test_memory_store_miss_then_hit() {
        let store = MemoryBlobStore::new();
        assert!(store.get(&key()).await.unwrap().is_none());

        let image = RenderedImage::new_unchecked(Bytes::from_static(b"\xff\xd8jpeg"));
        store.put(&key(), &image).await.unwrap();

        let object = store.get(&key()).await.unwrap().expect("hit");
        assert_eq!(object.content_length, Some(6));
        assert_eq!(object.collect().await.unwrap(), image.bytes().clone());
        assert_eq!(store.get_count(), 2);
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_collect_propagates_stream_errors() {
        let object = StoredObject {
            content_length: None,
            body: stream::iter(vec![
                Ok(Bytes::from_static(b"ab")),
                Err(StoreError::Body("reset".into())),
            ])
            .boxed(),
        };
        assert!(matches!(object.collect().await, Err(StoreError::Body(_))));
    }
}
