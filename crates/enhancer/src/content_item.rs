//! `ContentItem`: the unit of content being enhanced.
//!
//! The raw content is immutable. Everything engines and the job manager
//! write (the enhancement metadata and the execution metadata) lives behind
//! one read/write lock so a job's state transitions are atomic with respect
//! to engines touching the metadata.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{EngineError, ExecutionMetadata};

// ---------------------------------------------------------------------------
// Enhancement metadata
// ---------------------------------------------------------------------------

/// What an enhancement describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementKind {
    /// Something about a span of the text (a mention, a token count, …).
    TextAnnotation,
    /// A suggested entity for a text annotation.
    EntityAnnotation,
    /// A category the whole item belongs to (language, topic).
    TopicAnnotation,
}

/// A single enhancement written by an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enhancement {
    pub id: Uuid,
    /// Name of the engine that created it.
    pub creator: String,
    pub kind: EnhancementKind,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Enhancement {
    pub fn new(creator: impl Into<String>, kind: EnhancementKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            creator: creator.into(),
            kind,
            created: Utc::now(),
            properties: Map::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// The enhancement metadata of a content item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    enhancements: Vec<Enhancement>,
}

impl Metadata {
    pub fn add(&mut self, enhancement: Enhancement) {
        self.enhancements.push(enhancement);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Enhancement> {
        self.enhancements.iter()
    }

    pub fn created_by<'a>(&'a self, engine: &'a str) -> impl Iterator<Item = &'a Enhancement> {
        self.enhancements.iter().filter(move |e| e.creator == engine)
    }

    pub fn len(&self) -> usize {
        self.enhancements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enhancements.is_empty()
    }

    /// Remove and return every enhancement after the first `len`.
    pub fn split_off(&mut self, len: usize) -> Vec<Enhancement> {
        self.enhancements.split_off(len.min(self.enhancements.len()))
    }
}

impl Extend<Enhancement> for Metadata {
    fn extend<I: IntoIterator<Item = Enhancement>>(&mut self, iter: I) {
        self.enhancements.extend(iter);
    }
}

// ---------------------------------------------------------------------------
// ContentItem
// ---------------------------------------------------------------------------

/// The lock-guarded, mutable parts of a content item.
#[derive(Debug, Default)]
pub struct ItemParts {
    pub metadata: Metadata,
    /// Present once an enhancement job was created for the item.
    pub execution: Option<ExecutionMetadata>,
}

/// A document to enhance.
#[derive(Debug)]
pub struct ContentItem {
    uri: String,
    mime_type: String,
    content: Vec<u8>,
    parts: RwLock<ItemParts>,
}

impl ContentItem {
    pub fn new(uri: impl Into<String>, mime_type: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: mime_type.into(),
            content,
            parts: RwLock::new(ItemParts::default()),
        }
    }

    /// A `text/plain` item with a generated `urn:content-item:` uri.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::new(
            format!("urn:content-item:{}", Uuid::new_v4()),
            "text/plain",
            text.into().into_bytes(),
        )
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// The content as text, for `text/*` items with valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        if !self.mime_type.starts_with("text/") {
            return None;
        }
        std::str::from_utf8(&self.content).ok()
    }

    /// Shared access to the metadata parts.
    ///
    /// A panicking engine poisons the lock; the parts stay usable since the
    /// job manager records the panic as an engine failure.
    pub fn read(&self) -> RwLockReadGuard<'_, ItemParts> {
        self.parts.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the metadata parts.
    pub fn write(&self) -> RwLockWriteGuard<'_, ItemParts> {
        self.parts.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared access without waiting; `None` while the item is write-locked.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, ItemParts>> {
        match self.parts.try_read() {
            Ok(parts) => Some(parts),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Snapshot of the enhancement metadata.
    pub fn metadata(&self) -> Metadata {
        self.read().metadata.clone()
    }

    /// Snapshot of the execution metadata, if a job was created.
    pub fn execution_metadata(&self) -> Option<ExecutionMetadata> {
        self.read().execution.clone()
    }

    /// Snapshot of the enhancement metadata for async engines.
    ///
    /// The lock is taken on the blocking pool: a synchronous engine may hold
    /// the write lock for as long as it runs.
    pub async fn metadata_async(self: &Arc<Self>, engine: &str) -> Result<Metadata, EngineError> {
        let item = Arc::clone(self);
        tokio::task::spawn_blocking(move || item.metadata())
            .await
            .map_err(|err| EngineError::enhancement(engine, format!("unable to read {}: {err}", self.uri)))
    }

    /// Append `enhancements` to the metadata, locking on the blocking pool.
    pub async fn add_enhancements(
        self: &Arc<Self>,
        engine: &str,
        enhancements: Vec<Enhancement>,
    ) -> Result<(), EngineError> {
        if enhancements.is_empty() {
            return Ok(());
        }
        let item = Arc::clone(self);
        tokio::task::spawn_blocking(move || item.write().metadata.extend(enhancements))
            .await
            .map_err(|err| EngineError::enhancement(engine, format!("unable to update {}: {err}", self.uri)))
    }
}
