//! Video records as served by the backend, and the asset kinds the client
//! fetches for them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification a saved video is grouped under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Liked,
    Collected,
    Noted,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Liked => "liked",
            Category::Collected => "collected",
            Category::Noted => "noted",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "liked" => Ok(Category::Liked),
            "collected" => Ok(Category::Collected),
            "noted" => Ok(Category::Noted),
            other => Err(format!("unknown category '{}'", other)),
        }
    }
}

/// A saved video. The client only ever holds read-only copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoItem {
    /// Identity column; increases with creation and orders the sequence.
    pub id: i64,
    #[serde(default)]
    pub user_id: String,
    #[serde(rename = "type")]
    pub category: Category,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "video_src", default)]
    pub media_url: Option<String>,
    #[serde(rename = "image_src", default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl VideoItem {
    /// Remote media URL, if the record has a usable one.
    pub fn media(&self) -> Option<&str> {
        self.media_url.as_deref().filter(|u| !u.trim().is_empty())
    }

    /// Visible, in `category`, and playable.
    pub fn is_eligible(&self, category: Category) -> bool {
        !self.is_hidden && self.category == category && self.media().is_some()
    }
}

/// Asset kinds that can be fetched through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Video,
    Thumbnail,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Video => "video",
            AssetKind::Thumbnail => "image",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AssetKind::Video => "mp4",
            AssetKind::Thumbnail => "jpg",
        }
    }

    /// Query parameter carrying the upstream URL on the proxy endpoint.
    pub fn query_param(&self) -> &'static str {
        match self {
            AssetKind::Video => "videoUrl",
            AssetKind::Thumbnail => "imageUrl",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AssetKind::Video => "video/mp4",
            AssetKind::Thumbnail => "image/jpeg",
        }
    }

    pub fn attachment_name(&self) -> String {
        format!("{}.{}", self.as_str(), self.extension())
    }
}
