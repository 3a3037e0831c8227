use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

const SEGMENT_CHANGES_COLLECTION: &str = "SEGMENT_CHANGES_COLLECTION";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("corrupt cache entry {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A segment definition as last seen from the SDK server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentChangesItem {
    pub name: String,
    pub keys: BTreeSet<String>,
}

/// Local copy of segment definitions, used for fallback reads when the
/// upstream is unavailable. Keyed by segment name.
#[derive(Clone)]
pub struct SegmentChangesCollection {
    tree: sled::Tree,
}

impl SegmentChangesCollection {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db = sled::open(path)?;
        Self::new(&db)
    }

    pub fn new(db: &sled::Db) -> Result<Self, CacheError> {
        Ok(Self {
            tree: db.open_tree(SEGMENT_CHANGES_COLLECTION)?,
        })
    }

    /// Insert or replace the entry for `item.name`.
    pub fn save(&self, item: &SegmentChangesItem) -> Result<(), CacheError> {
        let value = serde_json::to_vec(item).map_err(|source| CacheError::Codec {
            key: item.name.clone(),
            source,
        })?;
        self.tree.insert(item.name.as_bytes(), value)?;
        Ok(())
    }

    pub fn fetch(&self, name: &str) -> Result<Option<SegmentChangesItem>, CacheError> {
        let Some(raw) = self.tree.get(name.as_bytes())? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw).map(Some).map_err(|source| {
            error!(segment = name, error = %source, "failed to decode cached segment");
            CacheError::Codec {
                key: name.to_owned(),
                source,
            }
        })
    }
}
