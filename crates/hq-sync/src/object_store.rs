//! The object-store seam.
//!
//! The poller only needs two operations — a paginated prefix listing and a
//! body fetch — so that is the whole trait. Production uses
//! [`S3ObjectStore`](crate::s3::S3ObjectStore); tests use
//! [`MemoryObjectStore`].

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::errors::{Result, SyncError};

/// One remote object as seen in a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full object key (prefix included).
    pub key: String,
    /// Last modification, milliseconds since the Unix epoch.
    pub last_modified_ms: i64,
    /// Entity tag; equality means the body is unchanged.
    pub etag: String,
    /// Body size in bytes.
    pub size: u64,
}

/// One page of a listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    /// Objects on this page.
    pub objects: Vec<RemoteObject>,
    /// Continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

/// Minimal object-store interface consumed by the poller.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List one page of objects under `prefix`.
    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage>;

    /// Fetch an object body.
    async fn get(&self, key: &str) -> Result<Bytes>;
}

/// In-memory object store for tests.
///
/// Pagination is driven by `page_size` so multi-page listing paths are
/// exercised without a live bucket.
#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    page_size: usize,
    fail_listing: RwLock<bool>,
    fail_get_keys: RwLock<std::collections::HashSet<String>>,
}

#[derive(Clone, Debug)]
struct StoredObject {
    body: Bytes,
    last_modified_ms: i64,
    etag: String,
}

impl MemoryObjectStore {
    /// Empty store with the given listing page size.
    pub fn new(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
            fail_listing: RwLock::new(false),
            fail_get_keys: RwLock::new(std::collections::HashSet::new()),
        }
    }

    /// Insert or replace an object. The etag is the SHA-256 of the body, so
    /// rewriting identical content leaves the etag unchanged.
    pub fn put(&self, key: &str, body: impl Into<Bytes>, last_modified_ms: i64) {
        let body = body.into();
        let etag = hex_digest(&body);
        let _ = self.objects.write().insert(
            key.to_string(),
            StoredObject {
                body,
                last_modified_ms,
                etag,
            },
        );
    }

    /// Remove an object.
    pub fn delete(&self, key: &str) {
        let _ = self.objects.write().remove(key);
    }

    /// The stored etag for a key, if present.
    pub fn etag_of(&self, key: &str) -> Option<String> {
        self.objects.read().get(key).map(|o| o.etag.clone())
    }

    /// Make subsequent listings fail (exercises the abort path).
    pub fn fail_next_listings(&self, fail: bool) {
        *self.fail_listing.write() = fail;
    }

    /// Make body fetches for `key` fail while keeping it listed (exercises
    /// the per-file error path).
    pub fn fail_get(&self, key: &str) {
        let _ = self.fail_get_keys.write().insert(key.to_string());
    }
}

fn hex_digest(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        if *self.fail_listing.read() {
            return Err(SyncError::List("injected listing failure".into()));
        }
        let objects = self.objects.read();
        let matching: Vec<(&String, &StoredObject)> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect();

        let start = match token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| SyncError::List(format!("bad continuation token: {t}")))?,
            None => 0,
        };
        let page: Vec<RemoteObject> = matching
            .iter()
            .skip(start)
            .take(self.page_size)
            .map(|(key, obj)| RemoteObject {
                key: (*key).clone(),
                last_modified_ms: obj.last_modified_ms,
                etag: obj.etag.clone(),
                size: obj.body.len() as u64,
            })
            .collect();
        let next = start + page.len();
        let next_token = (next < matching.len()).then(|| next.to_string());
        Ok(ListPage {
            objects: page,
            next_token,
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        if self.fail_get_keys.read().contains(key) {
            return Err(SyncError::Download {
                key: key.to_string(),
                message: "injected download failure".into(),
            });
        }
        self.objects
            .read()
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| SyncError::Download {
                key: key.to_string(),
                message: "no such key".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_filters_by_prefix() {
        let store = MemoryObjectStore::new(10);
        store.put("user1/hq/a.txt", "a", 1);
        store.put("user1/hq/b.txt", "b", 2);
        store.put("user2/hq/c.txt", "c", 3);

        let page = store.list_page("user1/hq/", None).await.unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn listing_paginates() {
        let store = MemoryObjectStore::new(2);
        for i in 0..5 {
            store.put(&format!("p/{i}.txt"), "x", i);
        }
        let first = store.list_page("p/", None).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        let token = first.next_token.unwrap();
        let second = store.list_page("p/", Some(&token)).await.unwrap();
        assert_eq!(second.objects.len(), 2);
        let token = second.next_token.unwrap();
        let third = store.list_page("p/", Some(&token)).await.unwrap();
        assert_eq!(third.objects.len(), 1);
        assert!(third.next_token.is_none());
    }

    #[tokio::test]
    async fn etag_tracks_content() {
        let store = MemoryObjectStore::new(10);
        store.put("k", "v1", 1);
        let first = store.etag_of("k").unwrap();
        store.put("k", "v1", 2);
        assert_eq!(store.etag_of("k").unwrap(), first, "same body, same etag");
        store.put("k", "v2", 3);
        assert_ne!(store.etag_of("k").unwrap(), first);
    }

    #[tokio::test]
    async fn get_missing_key_is_download_error() {
        let store = MemoryObjectStore::new(10);
        let err = store.get("absent").await.unwrap_err();
        assert!(matches!(err, SyncError::Download { .. }));
    }
}
