//! Paged listing of a user's saved videos, newest first.

use crate::assets::{Category, VideoItem};
use crate::error::Result;
use crate::source::{VideoQuery, VideoSource};
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct VideoPage {
    pub items: Vec<VideoItem>,
    /// Eligible items across all pages.
    pub total: u64,
    /// 1-based.
    pub page: usize,
    pub pages: usize,
    pub has_more: bool,
}

pub struct VideoLibrary<S> {
    source: Arc<S>,
}

impl<S: VideoSource> VideoLibrary<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }

    /// One page of eligible items, optionally filtered by title.
    pub async fn page(
        &self,
        owner: &str,
        category: Category,
        page: usize,
        page_size: usize,
        keyword: Option<&str>,
    ) -> Result<VideoPage> {
        let page = page.max(1);
        let page_size = page_size.max(1);

        let mut query = VideoQuery::eligible(owner, category).descending();
        if let Some(keyword) = keyword {
            query = query.title_contains(keyword);
        }

        let total = self.source.count(&query).await?;
        let items = self
            .source
            .fetch(&query.offset((page - 1) * page_size).limit(page_size))
            .await?;

        let pages = (total as usize).div_ceil(page_size);
        tracing::debug!(
            "Listed {} page {}/{} ({} items, {} total)",
            category,
            page,
            pages,
            items.len(),
            total
        );

        Ok(VideoPage {
            items,
            total,
            page,
            pages,
            has_more: page * page_size < total as usize,
        })
    }

    /// Hide an item from every list and from next-video selection.
    pub async fn hide(&self, owner: &str, id: i64) -> Result<()> {
        self.source.set_hidden(owner, id, true).await?;
        tracing::info!("Video {} hidden", id);
        Ok(())
    }
}
