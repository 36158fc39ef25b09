//! The `EnhancementEngine` trait: the contract every engine must fulfil.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{ContentItem, EngineError, Metadata};

/// How an engine wants to process a given content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnhanceMode {
    /// Run with exclusive (write-locked) access to the item's metadata.
    Synchronous,
    /// Run without any lock; the engine adds its results through
    /// [`ContentItem::add_enhancements`].
    Asynchronous,
    /// The engine has nothing to contribute for this item. Not an error.
    CannotEnhance,
}

/// A pluggable unit performing one enhancement step.
///
/// The job manager first calls [`can_enhance`](Self::can_enhance). For
/// [`EnhanceMode::Synchronous`] it then calls
/// [`compute_enhancements`](Self::compute_enhancements) on a blocking thread
/// while holding the item's write lock. For [`EnhanceMode::Asynchronous`] it
/// awaits [`compute_enhancements_async`](Self::compute_enhancements_async)
/// without holding any lock.
#[async_trait]
pub trait EnhancementEngine: Send + Sync {
    /// Unique engine name; execution plans refer to engines by it.
    fn name(&self) -> &str;

    /// Decide whether (and how) this engine processes `item`.
    fn can_enhance(&self, item: &ContentItem) -> Result<EnhanceMode, EngineError>;

    /// Compute the enhancements and add them to `metadata`.
    ///
    /// Called with the item's write lock held; must not lock `item` again.
    fn compute_enhancements(
        &self,
        item: &ContentItem,
        metadata: &mut Metadata,
    ) -> Result<(), EngineError>;

    /// Asynchronous variant, called without any lock held.
    ///
    /// Must never block on the item's lock: a synchronous engine may hold it
    /// for its whole run. The default runs the synchronous computation on a
    /// snapshot of the metadata and appends whatever it added.
    async fn compute_enhancements_async(&self, item: &Arc<ContentItem>) -> Result<(), EngineError> {
        let mut metadata = item.metadata_async(self.name()).await?;
        let known = metadata.len();
        self.compute_enhancements(item, &mut metadata)?;
        item.add_enhancements(self.name(), metadata.split_off(known)).await
    }
}
