//! Mock object storage for testing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::storage::{
    ObjectProperties, ObjectStorage, ObjectStorageError, RehydrationPriority, Tier,
};

#[derive(Debug, Clone)]
struct MockObject {
    tier: Tier,
    size_bytes: u64,
    rehydrating: Option<RehydrationPriority>,
}

/// A recorded rehydration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRehydration {
    pub location: String,
    pub priority: RehydrationPriority,
}

/// Mock implementation of the ObjectStorage trait.
///
/// Unknown locations are treated as hot objects, so artifacts reported by
/// mock workers can be tiered without uploading anything first. Archived
/// objects stay archived until `complete_rehydrations` is called.
#[derive(Debug, Default)]
pub struct MockObjectStorage {
    objects: Arc<RwLock<HashMap<String, MockObject>>>,
    rehydrations: Arc<RwLock<Vec<RecordedRehydration>>>,
    /// If set, the next tier change fails with this error.
    next_error: Arc<RwLock<Option<ObjectStorageError>>>,
}

impl MockObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object in the given tier.
    pub async fn put(&self, location: &str, tier: Tier, size_bytes: u64) {
        self.objects.write().await.insert(
            location.to_string(),
            MockObject {
                tier,
                size_bytes,
                rehydrating: None,
            },
        );
    }

    /// Current tier of the object, if it was touched.
    pub async fn tier_of(&self, location: &str) -> Option<Tier> {
        self.objects.read().await.get(location).map(|o| o.tier)
    }

    pub async fn contains(&self, location: &str) -> bool {
        self.objects.read().await.contains_key(location)
    }

    /// Rehydration requests received so far.
    pub async fn rehydration_requests(&self) -> Vec<RecordedRehydration> {
        self.rehydrations.read().await.clone()
    }

    /// Moves every rehydrating object to the hot tier. Returns how many.
    pub async fn complete_rehydrations(&self) -> usize {
        let mut objects = self.objects.write().await;
        let mut completed = 0;
        for object in objects.values_mut() {
            if object.rehydrating.take().is_some() {
                object.tier = Tier::Hot;
                completed += 1;
            }
        }
        completed
    }

    /// Configure the next tier change to fail with the given error.
    pub async fn set_next_error(&self, error: ObjectStorageError) {
        *self.next_error.write().await = Some(error);
    }
}

#[async_trait]
impl ObjectStorage for MockObjectStorage {
    fn name(&self) -> &str {
        "mock"
    }

    async fn set_tier(&self, location: &str, tier: Tier) -> Result<(), ObjectStorageError> {
        if let Some(err) = self.next_error.write().await.take() {
            return Err(err);
        }
        let mut objects = self.objects.write().await;
        let object = objects
            .entry(location.to_string())
            .or_insert_with(|| MockObject {
                tier: Tier::Hot,
                size_bytes: 0,
                rehydrating: None,
            });
        if object.tier == Tier::Archive && tier != Tier::Archive {
            return Err(ObjectStorageError::Rejected {
                location: location.to_string(),
                reason: "archived objects must be rehydrated".to_string(),
            });
        }
        object.tier = tier;
        Ok(())
    }

    async fn get_properties(
        &self,
        location: &str,
    ) -> Result<ObjectProperties, ObjectStorageError> {
        let objects = self.objects.read().await;
        Ok(match objects.get(location) {
            Some(object) => ObjectProperties {
                tier: object.tier,
                size_bytes: object.size_bytes,
                last_accessed: None,
            },
            None => ObjectProperties {
                tier: Tier::Hot,
                size_bytes: 0,
                last_accessed: None,
            },
        })
    }

    async fn rehydrate(
        &self,
        location: &str,
        priority: RehydrationPriority,
    ) -> Result<String, ObjectStorageError> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(location)
            .ok_or_else(|| ObjectStorageError::NotFound(location.to_string()))?;
        if object.tier != Tier::Archive {
            return Err(ObjectStorageError::Rejected {
                location: location.to_string(),
                reason: format!("object is in {} tier", object.tier),
            });
        }
        object.rehydrating = Some(priority);
        self.rehydrations.write().await.push(RecordedRehydration {
            location: location.to_string(),
            priority,
        });
        Ok(format!("mock-rehydration:{}", location))
    }

    async fn delete(&self, location: &str) -> Result<(), ObjectStorageError> {
        self.objects.write().await.remove(location);
        Ok(())
    }
}
