//! Filesystem object storage with per-tier directories.
//!
//! Objects live under `<root>/<tier>/<location>`. Rehydration writes a
//! request file under `<root>/.rehydration/` and the object moves to the
//! hot tier the first time its properties are read after the request's
//! ready time.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use super::config::StorageConfig;
use super::error::ObjectStorageError;
use super::traits::ObjectStorage;
use super::types::{ObjectProperties, RehydrationPriority, Tier};

const REHYDRATION_DIR: &str = ".rehydration";

#[derive(Debug, Serialize, Deserialize)]
struct RehydrationRequest {
    location: String,
    priority: RehydrationPriority,
    ready_at: DateTime<Utc>,
}

/// Object storage backed by a local directory tree.
pub struct FsObjectStorage {
    root: PathBuf,
    standard_delay: Duration,
    expedited_delay: Duration,
}

impl FsObjectStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.root.clone(),
            standard_delay: Duration::from_secs(config.standard_rehydration_eta_secs),
            expedited_delay: Duration::from_secs(config.expedited_rehydration_eta_secs),
        }
    }

    /// Overrides how long rehydrations take to complete.
    pub fn with_rehydration_delays(mut self, standard: Duration, expedited: Duration) -> Self {
        self.standard_delay = standard;
        self.expedited_delay = expedited;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes an object into the hot tier.
    pub async fn put(&self, location: &str, data: &[u8]) -> Result<(), ObjectStorageError> {
        let path = self.object_path(location, Tier::Hot)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(())
    }

    /// Reads an object from an accessible tier.
    pub async fn read(&self, location: &str) -> Result<Vec<u8>, ObjectStorageError> {
        let (tier, path) = self.locate(location).await?;
        if !tier.is_accessible() {
            return Err(ObjectStorageError::Rejected {
                location: location.to_string(),
                reason: "object is archived".to_string(),
            });
        }
        Ok(fs::read(path).await?)
    }

    fn object_path(&self, location: &str, tier: Tier) -> Result<PathBuf, ObjectStorageError> {
        let relative = Path::new(location);
        let is_safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if location.is_empty() || !is_safe {
            return Err(ObjectStorageError::Rejected {
                location: location.to_string(),
                reason: "location must be a relative path".to_string(),
            });
        }
        Ok(self.root.join(tier.as_str()).join(relative))
    }

    fn request_path(&self, location: &str) -> PathBuf {
        let digest = Sha256::digest(location.as_bytes());
        self.root
            .join(REHYDRATION_DIR)
            .join(format!("{:x}.json", digest))
    }

    async fn locate(&self, location: &str) -> Result<(Tier, PathBuf), ObjectStorageError> {
        for tier in Tier::ALL {
            let path = self.object_path(location, tier)?;
            if fs::try_exists(&path).await? {
                return Ok((tier, path));
            }
        }
        Err(ObjectStorageError::NotFound(location.to_string()))
    }

    async fn move_object(&self, from: &Path, to: &Path) -> Result<(), ObjectStorageError> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(from, to).await?;
        Ok(())
    }

    async fn pending_request(
        &self,
        location: &str,
    ) -> Result<Option<RehydrationRequest>, ObjectStorageError> {
        let path = self.request_path(location);
        match fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data).map(Some).map_err(|e| {
                ObjectStorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_request(&self, location: &str) -> Result<(), ObjectStorageError> {
        match fs::remove_file(self.request_path(location)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Completes a pending rehydration whose ready time has passed.
    async fn settle_rehydration(
        &self,
        location: &str,
        tier: Tier,
        path: PathBuf,
    ) -> Result<(Tier, PathBuf), ObjectStorageError> {
        if tier != Tier::Archive {
            return Ok((tier, path));
        }
        let Some(request) = self.pending_request(location).await? else {
            return Ok((tier, path));
        };
        if Utc::now() < request.ready_at {
            return Ok((tier, path));
        }

        let target = self.object_path(location, Tier::Hot)?;
        self.move_object(&path, &target).await?;
        self.clear_request(location).await?;
        debug!(location, "Rehydration completed");
        Ok((Tier::Hot, target))
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    fn name(&self) -> &str {
        "fs"
    }

    async fn set_tier(&self, location: &str, tier: Tier) -> Result<(), ObjectStorageError> {
        let (current, path) = self.locate(location).await?;
        if current == tier {
            return Ok(());
        }
        if current == Tier::Archive {
            return Err(ObjectStorageError::Rejected {
                location: location.to_string(),
                reason: "archived objects must be rehydrated".to_string(),
            });
        }

        let target = self.object_path(location, tier)?;
        self.move_object(&path, &target).await?;
        if tier == Tier::Archive {
            self.clear_request(location).await?;
        }
        Ok(())
    }

    async fn get_properties(
        &self,
        location: &str,
    ) -> Result<ObjectProperties, ObjectStorageError> {
        let (tier, path) = self.locate(location).await?;
        let (tier, path) = self.settle_rehydration(location, tier, path).await?;

        let metadata = fs::metadata(&path).await?;
        let last_accessed = metadata.accessed().ok().map(DateTime::<Utc>::from);
        Ok(ObjectProperties {
            tier,
            size_bytes: metadata.len(),
            last_accessed,
        })
    }

    async fn rehydrate(
        &self,
        location: &str,
        priority: RehydrationPriority,
    ) -> Result<String, ObjectStorageError> {
        let (tier, _) = self.locate(location).await?;
        if tier != Tier::Archive {
            return Err(ObjectStorageError::Rejected {
                location: location.to_string(),
                reason: format!("object is in tier {}, not archive", tier),
            });
        }

        let delay = match priority {
            RehydrationPriority::Standard => self.standard_delay,
            RehydrationPriority::Expedited => self.expedited_delay,
        };
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

        // A repeated request keeps the earlier ready time unless it is faster.
        let ready_at = match self.pending_request(location).await? {
            Some(existing) => existing.ready_at.min(Utc::now() + delay),
            None => Utc::now() + delay,
        };
        let request = RehydrationRequest {
            location: location.to_string(),
            priority,
            ready_at,
        };

        let path = self.request_path(location);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec(&request).map_err(|e| {
            ObjectStorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        fs::write(&path, body).await?;

        let handle = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(handle)
    }

    async fn delete(&self, location: &str) -> Result<(), ObjectStorageError> {
        match self.locate(location).await {
            Ok((_, path)) => fs::remove_file(path).await?,
            Err(ObjectStorageError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.clear_request(location).await
    }
}
