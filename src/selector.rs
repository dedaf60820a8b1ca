//! Next-video selection.
//!
//! Stateless: every call queries the source afresh. Sequential order follows
//! the item id and wraps to the first item; random order picks uniformly over
//! every eligible item, not just one fetched page.

use crate::assets::{Category, VideoItem};
use crate::error::{Error, Result};
use crate::source::{VideoQuery, VideoSource};
use rand::Rng;
use std::sync::Arc;

/// Picks the next item from a [`VideoSource`].
pub struct NextVideoSelector<S> {
    source: Arc<S>,
}

impl<S> Clone for NextVideoSelector<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<S: VideoSource> NextVideoSelector<S> {
    /// Selector over `source`, shared with whoever else queries it.
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }

    /// Underlying source, for operations beyond selection.
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// The item that plays after `current_id` within `category`.
    pub async fn next(
        &self,
        owner: &str,
        current_id: i64,
        category: Category,
        randomize: bool,
    ) -> Result<VideoItem> {
        let current = self
            .source
            .get(owner, current_id)
            .await?
            .ok_or(Error::NotFound)?;

        let next = if randomize {
            self.next_random(owner, &current, category).await?
        } else {
            self.next_sequential(owner, &current, category).await?
        };

        tracing::debug!(
            "Next after {} in {} ({}): {}",
            current_id,
            category,
            if randomize { "random" } else { "order" },
            next.id
        );
        Ok(next)
    }

    async fn next_sequential(
        &self,
        owner: &str,
        current: &VideoItem,
        category: Category,
    ) -> Result<VideoItem> {
        let following = VideoQuery::eligible(owner, category)
            .after(current.id)
            .limit(1);
        if let Some(item) = self.first_row(&following).await? {
            return Ok(item);
        }

        // Current is last: wrap to the first item.
        let first = VideoQuery::eligible(owner, category).limit(1);
        self.first_row(&first).await?.ok_or(Error::NotFound)
    }

    async fn next_random(
        &self,
        owner: &str,
        current: &VideoItem,
        category: Category,
    ) -> Result<VideoItem> {
        let others = VideoQuery::eligible(owner, category).excluding(current.id);
        let count = self.source.count(&others).await?;

        if count == 0 {
            // Only the current item is left; play it again.
            return if current.is_eligible(category) {
                Ok(current.clone())
            } else {
                Err(Error::NotFound)
            };
        }

        let offset = rand::thread_rng().gen_range(0..count) as usize;
        if let Some(item) = self.first_row(&others.clone().offset(offset).limit(1)).await? {
            return Ok(item);
        }

        // Rows vanished between count and fetch.
        tracing::debug!("Random offset {} of {} came back empty, retrying at 0", offset, count);
        self.first_row(&others.limit(1))
            .await?
            .ok_or(Error::NotFound)
    }

    async fn first_row(&self, query: &VideoQuery) -> Result<Option<VideoItem>> {
        Ok(self.source.fetch(query).await?.into_iter().next())
    }
}
