use crate::error::TransferError;
use bytes::Bytes;
use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use uuid::Uuid;

const URL_SCHEME: &str = "blob:";

static GLOBAL_STORE: Lazy<BlobStore> = Lazy::new(BlobStore::new);

/// Bytes of a finished transfer together with their declared content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    bytes: Bytes,
    content_type: Option<String>,
}

impl Blob {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Registry of live in-memory blobs, addressable by `blob:` URLs.
///
/// Clones share the same registry. A store may cap how many blobs are alive at
/// once; allocation past the cap fails instead of evicting anything.
#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    blobs: Arc<Mutex<HashMap<Uuid, Blob>>>,
    limit: Option<usize>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_limit(limit: usize) -> Self {
        Self {
            blobs: Arc::default(),
            limit: Some(limit),
        }
    }
    /// The process-wide store sessions use unless given another one.
    pub fn global() -> Self {
        GLOBAL_STORE.clone()
    }
    pub fn create(&self, bytes: impl Into<Bytes>, content_type: Option<String>) -> Result<PayloadHandle, TransferError> {
        let mut blobs = self.lock();
        if let Some(limit) = self.limit {
            if blobs.len() >= limit {
                return Err(TransferError::HandleLimit(limit));
            }
        }
        let id = Uuid::new_v4();
        let blob = Blob {
            bytes: bytes.into(),
            content_type,
        };
        log::debug!("Allocated blob {id} ({} bytes)", blob.len());
        blobs.insert(id, blob);
        Ok(PayloadHandle { id, store: self.clone() })
    }
    /// Releases the blob behind `handle`. Revoking twice is harmless.
    pub fn revoke(&self, handle: &PayloadHandle) {
        if self.lock().remove(&handle.id).is_some() {
            log::debug!("Revoked blob {}", handle.id);
        }
    }
    pub fn resolve(&self, handle: &PayloadHandle) -> Option<Blob> {
        self.lock().get(&handle.id).cloned()
    }
    pub fn resolve_url(&self, url: &str) -> Option<Blob> {
        let id = url.strip_prefix(URL_SCHEME)?.parse::<Uuid>().ok()?;
        self.lock().get(&id).cloned()
    }
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Blob>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Opaque reference to a blob held by a [`BlobStore`].
///
/// Cloning the handle does not copy or retain the blob: once any holder
/// revokes it, every clone observes the release.
#[derive(Debug, Clone)]
pub struct PayloadHandle {
    id: Uuid,
    store: BlobStore,
}

impl PayloadHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn url(&self) -> String {
        format!("{URL_SCHEME}{}", self.id)
    }
    /// Copy of the backing data, or `None` once revoked.
    pub fn blob(&self) -> Option<Blob> {
        self.store.resolve(self)
    }
    pub fn content_type(&self) -> Option<String> {
        self.blob().and_then(|blob| blob.content_type)
    }
    pub fn len(&self) -> Option<usize> {
        self.blob().map(|blob| blob.len())
    }
    pub fn is_revoked(&self) -> bool {
        self.blob().is_none()
    }
    pub(crate) fn revoke(&self) {
        self.store.revoke(self);
    }
}

impl PartialEq for PayloadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PayloadHandle {}
