//! S3 implementation of the [`ObjectStore`] seam.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use bytes::Bytes;

use crate::errors::{Result, SyncError};
use crate::object_store::{ListPage, ObjectStore, RemoteObject};

/// Object store backed by an S3 bucket.
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Wrap an existing client.
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the ambient AWS environment (credentials chain,
    /// region, endpoint overrides).
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self::new(Client::new(&config), bucket)
    }

    /// The bucket this store reads from.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(token.map(String::from))
            .send()
            .await
            .map_err(|e| SyncError::List(e.to_string()))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?.to_string();
                Some(RemoteObject {
                    last_modified_ms: object
                        .last_modified()
                        .map(|dt| dt.to_millis().unwrap_or(0))
                        .unwrap_or(0),
                    // S3 wraps etags in quotes.
                    etag: object
                        .e_tag()
                        .map(|tag| tag.trim_matches('"').to_string())
                        .unwrap_or_default(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    key,
                })
            })
            .collect();

        Ok(ListPage {
            objects,
            next_token: response.next_continuation_token().map(String::from),
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| SyncError::Download {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        let aggregated = response
            .body
            .collect()
            .await
            .map_err(|e| SyncError::Download {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        Ok(aggregated.into_bytes())
    }
}
