//! S3-compatible blob store
//!
//! Works against AWS S3 as well as R2/MinIO style endpoints.

use crate::{BlobStore, ByteStream, CacheKey, RenderedImage, StorageConfig, StoreError, StoredObject};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream as S3ByteStream;
use aws_sdk_s3::Client;
use futures::StreamExt;
use tracing::{info, warn};

#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "screenshot-server",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        let store = Self::from_client(client, config.bucket.clone());

        // A missing bucket is logged, not fatal: every read then degrades to a render.
        match store.client.head_bucket().bucket(&store.bucket).send().await {
            Ok(_) => info!("Connected to S3 bucket: {}", store.bucket),
            Err(e) => warn!(
                "Could not verify bucket {}: {}. Will attempt operations anyway.",
                store.bucket,
                e
            ),
        }

        store
    }

    pub fn from_client(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().map(str::to_string);
    let message = aws_sdk_s3::error::DisplayErrorContext(&err).to_string();
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            StoreError::Transport(message)
        }
        _ if matches!(code.as_deref(), Some("AccessDenied" | "Forbidden" | "InvalidAccessKeyId" | "SignatureDoesNotMatch")) => {
            StoreError::AccessDenied(message)
        }
        _ => StoreError::Other(message),
    }
}

/// `NoSuchKey` is a miss (`None`); anything else is a store failure.
fn lookup_failure(err: SdkError<GetObjectError, HttpResponse>) -> Option<StoreError> {
    match err.as_service_error() {
        Some(service) if service.is_no_such_key() => None,
        _ => Some(classify(err)),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<StoredObject>, StoreError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return match lookup_failure(e) {
                    Some(err) => Err(err),
                    None => Ok(None),
                }
            }
        };

        let content_length = response
            .content_length()
            .and_then(|len| u64::try_from(len).ok());

        let body: ByteStream = futures::stream::unfold(response.body, |mut body: S3ByteStream| async move {
            body.next()
                .await
                .map(|chunk| (chunk.map_err(|e| StoreError::Body(e.to_string())), body))
        })
        .boxed();

        Ok(Some(StoredObject {
            content_length,
            body,
        }))
    }

    async fn put(&self, key: &CacheKey, image: &RenderedImage) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(S3ByteStream::from(image.bytes().clone()))
            .content_type("image/jpeg")
            .content_length(image.content_length() as i64)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::error::ErrorMetadata;
    use aws_sdk_s3::types::error::NoSuchKey;
    use aws_smithy_runtime_api::http::StatusCode;
    use aws_smithy_types::body::SdkBody;

    fn response(status: u16) -> HttpResponse {
        HttpResponse::new(StatusCode::try_from(status).unwrap(), SdkBody::empty())
    }

    fn service_error(err: GetObjectError, status: u16) -> SdkError<GetObjectError, HttpResponse> {
        SdkError::service_error(err, response(status))
    }

    fn coded(code: &str) -> GetObjectError {
        GetObjectError::generic(ErrorMetadata::builder().code(code).message("rejected").build())
    }

    #[test]
    fn test_no_such_key_is_a_miss() {
        let err = service_error(GetObjectError::NoSuchKey(NoSuchKey::builder().build()), 404);
        assert!(lookup_failure(err).is_none());
    }

    #[test]
    fn test_timeout_is_transport_failure() {
        let err = SdkError::<GetObjectError, HttpResponse>::timeout_error("read timed out");
        assert!(matches!(lookup_failure(err), Some(StoreError::Transport(_))));
    }

    #[test]
    fn test_permission_errors_are_access_denied() {
        for code in ["AccessDenied", "InvalidAccessKeyId", "SignatureDoesNotMatch"] {
            let err = service_error(coded(code), 403);
            assert!(
                matches!(lookup_failure(err), Some(StoreError::AccessDenied(_))),
                "{code} should be access denied"
            );
        }
    }

    #[test]
    fn test_other_service_errors_are_not_misses() {
        let err = service_error(coded("InternalError"), 500);
        assert!(matches!(lookup_failure(err), Some(StoreError::Other(_))));
    }
}
