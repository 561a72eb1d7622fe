//! S3-compatible backend (MinIO, AWS S3) on the AWS SDK, path-style addressing
//! and static credentials from the sidecar settings.

use super::{normalize_etag, ObjectInfo, ObjectReader, ObjectStore, StoreError};
use crate::settings::StoreSettings;
use async_trait::async_trait;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(settings: &StoreSettings) -> Self {
        let credentials = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.expose().to_string(),
            None,
            None,
            "model-sync-settings",
        );
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .operation_timeout(settings.request_timeout())
            .build();
        let conf = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(settings.endpoint_url())
            .credentials_provider(credentials)
            .force_path_style(true)
            .timeout_config(timeouts)
            .build();
        tracing::info!(endpoint=%settings.endpoint_url(), region=%settings.region, "object store client configured");
        Self { client: Client::from_conf(conf) }
    }
}

fn transport<E: std::error::Error>(e: E) -> StoreError { StoreError::Transport(DisplayErrorContext(&e).to_string()) }

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(transport)?;
            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj.last_modified().and_then(to_chrono),
                    hash: obj.e_tag().map(normalize_etag),
                });
            }
            match (page.is_truncated(), page.next_continuation_token()) {
                (Some(true), Some(next)) => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn open_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, StoreError> {
        let out = self.client.get_object().bucket(bucket).key(key).send().await.map_err(|e| {
            if e.as_service_error().map_or(false, |se| se.is_no_such_key()) {
                StoreError::NotFound(key.to_string())
            } else {
                transport(e)
            }
        })?;
        Ok(Box::pin(out.body.into_async_read()))
    }

    async fn object_hash(&self, bucket: &str, key: &str) -> Result<Option<String>, StoreError> {
        let out = self.client.head_object().bucket(bucket).key(key).send().await.map_err(|e| {
            if e.as_service_error().map_or(false, |se| se.is_not_found()) {
                StoreError::NotFound(key.to_string())
            } else {
                transport(e)
            }
        })?;
        Ok(out.e_tag().map(normalize_etag))
    }

    async fn check_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Bucket { bucket: bucket.to_string(), reason: DisplayErrorContext(&e).to_string() })
    }
}
