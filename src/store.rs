//! Asset and record storage.
//!
//! Two seams, both async traits so a deployment can back them with object
//! storage and a database:
//!
//! * [`AssetStore`]: binary uploads, addressed by collection, plus named
//!   conversions derived from them (`vision-optimized`).
//! * [`RecordStore`]: [`InvoiceRecord`] persistence with a compare-and-set
//!   update, which is what makes an extraction job safe under double dispatch.
//!
//! [`FsAssetStore`], [`InMemoryAssetStore`] and [`InMemoryRecordStore`] are the
//! bundled backends.

use crate::error::StoreError;
use crate::record::{InvoiceRecord, InvoiceStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Reference to a stored original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub id: Uuid,
    pub collection: String,
    pub mime: String,
    pub size: u64,
}

impl AssetRef {
    /// File extension for the original, derived from the MIME type.
    pub fn extension(&self) -> &'static str {
        extension_for(&self.mime)
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

/// Binary asset storage with named conversions.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store an original in `collection` and return its reference.
    async fn put(&self, bytes: &[u8], collection: &str, mime: &str) -> Result<AssetRef, StoreError>;

    /// Store a derived rendition of `asset` under `conversion`.
    async fn put_conversion(
        &self,
        asset: &AssetRef,
        conversion: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError>;

    /// Read the original (`conversion = None`) or a named conversion.
    async fn get(&self, asset: &AssetRef, conversion: Option<&str>) -> Result<Vec<u8>, StoreError>;

    /// `true` once `conversion` has been generated for `asset`.
    async fn has_conversion(&self, asset: &AssetRef, conversion: &str) -> Result<bool, StoreError>;

    /// `true` if the original is still present.
    async fn exists(&self, asset: &AssetRef) -> Result<bool, StoreError>;
}

/// Filesystem layout: `root/{collection}/{id}/original.{ext}` and
/// `root/{collection}/{id}/conversions/{name}.png`.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    root: PathBuf,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn asset_dir(&self, asset: &AssetRef) -> PathBuf {
        self.root
            .join(&asset.collection)
            .join(asset.id.to_string())
    }

    /// On-disk path of the original or of a conversion.
    pub fn path_of(&self, asset: &AssetRef, conversion: Option<&str>) -> PathBuf {
        let dir = self.asset_dir(asset);
        match conversion {
            None => dir.join(format!("original.{}", asset.extension())),
            Some(name) => dir.join("conversions").join(format!("{name}.png")),
        }
    }

    /// Write via a temp file + rename so readers never see partial files.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp_path, path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn put(&self, bytes: &[u8], collection: &str, mime: &str) -> Result<AssetRef, StoreError> {
        let asset = AssetRef {
            id: Uuid::new_v4(),
            collection: collection.to_string(),
            mime: mime.to_string(),
            size: bytes.len() as u64,
        };
        let path = self.path_of(&asset, None);
        Self::write_atomic(&path, bytes).await?;
        debug!(asset_id = %asset.id, path = %path.display(), "Stored original");
        Ok(asset)
    }

    async fn put_conversion(
        &self,
        asset: &AssetRef,
        conversion: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let path = self.path_of(asset, Some(conversion));
        Self::write_atomic(&path, bytes).await?;
        debug!(asset_id = %asset.id, conversion, bytes = bytes.len(), "Stored conversion");
        Ok(())
    }

    async fn get(&self, asset: &AssetRef, conversion: Option<&str>) -> Result<Vec<u8>, StoreError> {
        let path = self.path_of(asset, conversion);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::AssetNotFound(path.display().to_string()))
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn has_conversion(&self, asset: &AssetRef, conversion: &str) -> Result<bool, StoreError> {
        let path = self.path_of(asset, Some(conversion));
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    async fn exists(&self, asset: &AssetRef) -> Result<bool, StoreError> {
        let path = self.path_of(asset, None);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }
}

/// Process-local asset store for one-shot extraction and tests.
#[derive(Debug, Default)]
pub struct InMemoryAssetStore {
    blobs: RwLock<HashMap<(Uuid, Option<String>), Vec<u8>>>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the original of `asset`, keeping its conversions.
    pub async fn remove_original(&self, asset: &AssetRef) {
        self.blobs.write().await.remove(&(asset.id, None));
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn put(&self, bytes: &[u8], collection: &str, mime: &str) -> Result<AssetRef, StoreError> {
        let asset = AssetRef {
            id: Uuid::new_v4(),
            collection: collection.to_string(),
            mime: mime.to_string(),
            size: bytes.len() as u64,
        };
        self.blobs
            .write()
            .await
            .insert((asset.id, None), bytes.to_vec());
        Ok(asset)
    }

    async fn put_conversion(
        &self,
        asset: &AssetRef,
        conversion: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.blobs
            .write()
            .await
            .insert((asset.id, Some(conversion.to_string())), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, asset: &AssetRef, conversion: Option<&str>) -> Result<Vec<u8>, StoreError> {
        let key = (asset.id, conversion.map(str::to_string));
        self.blobs.read().await.get(&key).cloned().ok_or_else(|| {
            StoreError::AssetNotFound(format!(
                "{}/{}",
                asset.id,
                conversion.unwrap_or("original")
            ))
        })
    }

    async fn has_conversion(&self, asset: &AssetRef, conversion: &str) -> Result<bool, StoreError> {
        let key = (asset.id, Some(conversion.to_string()));
        Ok(self.blobs.read().await.contains_key(&key))
    }

    async fn exists(&self, asset: &AssetRef) -> Result<bool, StoreError> {
        Ok(self.blobs.read().await.contains_key(&(asset.id, None)))
    }
}

/// Record persistence.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: InvoiceRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<InvoiceRecord>, StoreError>;

    /// Replace the stored record only if its current status is `expected`.
    ///
    /// Returns `Ok(false)` without writing when the status has moved on.
    async fn update_if_status(
        &self,
        record: &InvoiceRecord,
        expected: InvoiceStatus,
    ) -> Result<bool, StoreError>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<InvoiceRecord>, StoreError>;
}

/// Process-local record store.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<Uuid, InvoiceRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: InvoiceRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<InvoiceRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update_if_status(
        &self,
        record: &InvoiceRecord,
        expected: InvoiceStatus,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let current = records
            .get_mut(&record.id)
            .ok_or(StoreError::RecordNotFound(record.id))?;
        if current.status != expected {
            return Ok(false);
        }
        *current = record.clone();
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<InvoiceRecord>, StoreError> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}
