//! Remote data query interface.
//!
//! The selector and list views only need the capability set of
//! [`VideoSource`]. [`RestVideoSource`] speaks to a PostgREST-style backend.

use crate::assets::{Category, VideoItem};
use crate::error::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter, ordering and pagination over a user's videos.
#[derive(Debug, Clone, Default)]
pub struct VideoQuery {
    pub owner: String,
    pub category: Option<Category>,
    pub visible_only: bool,
    pub require_media: bool,
    /// Keyset pagination: only ids strictly greater than this.
    pub after_id: Option<i64>,
    pub exclude_id: Option<i64>,
    pub title_contains: Option<String>,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl VideoQuery {
    /// Eligible items of `owner` in `category`: visible and playable.
    pub fn eligible(owner: &str, category: Category) -> Self {
        Self {
            owner: owner.to_string(),
            category: Some(category),
            visible_only: true,
            require_media: true,
            ..Default::default()
        }
    }

    pub fn after(mut self, id: i64) -> Self {
        self.after_id = Some(id);
        self
    }

    pub fn excluding(mut self, id: i64) -> Self {
        self.exclude_id = Some(id);
        self
    }

    pub fn title_contains(mut self, keyword: &str) -> Self {
        let keyword = keyword.trim();
        self.title_contains = (!keyword.is_empty()).then(|| keyword.to_string());
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether `item` passes the filters (ordering and paging aside).
    #[cfg(test)]
    pub fn matches(&self, item: &VideoItem) -> bool {
        if item.user_id != self.owner {
            return false;
        }
        if let Some(category) = self.category {
            if item.category != category {
                return false;
            }
        }
        if self.visible_only && item.is_hidden {
            return false;
        }
        if self.require_media && item.media().is_none() {
            return false;
        }
        if self.after_id.is_some_and(|after| item.id <= after) {
            return false;
        }
        if self.exclude_id == Some(item.id) {
            return false;
        }
        if let Some(ref keyword) = self.title_contains {
            if !item.title.to_lowercase().contains(&keyword.to_lowercase()) {
                return false;
            }
        }
        true
    }

    /// PostgREST query parameters. Paging is left out when `paged` is false.
    fn to_params(&self, paged: bool) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("select", "*".to_string()),
            ("user_id", format!("eq.{}", self.owner)),
        ];
        if let Some(category) = self.category {
            params.push(("type", format!("eq.{}", category)));
        }
        if self.visible_only {
            params.push(("is_hidden", "eq.false".to_string()));
        }
        if self.require_media {
            params.push(("video_src", "not.is.null".to_string()));
            params.push(("video_src", "neq.".to_string()));
        }
        if let Some(after) = self.after_id {
            params.push(("id", format!("gt.{}", after)));
        }
        if let Some(exclude) = self.exclude_id {
            params.push(("id", format!("neq.{}", exclude)));
        }
        if let Some(ref keyword) = self.title_contains {
            params.push(("title", format!("ilike.*{}*", keyword)));
        }
        if paged {
            let direction = match self.order {
                SortOrder::Ascending => "asc",
                SortOrder::Descending => "desc",
            };
            params.push(("order", format!("id.{}", direction)));
            if let Some(limit) = self.limit {
                params.push(("limit", limit.to_string()));
            }
            if let Some(offset) = self.offset {
                params.push(("offset", offset.to_string()));
            }
        }
        params
    }
}

/// Capability set the client needs from the remote store.
pub trait VideoSource: Send + Sync {
    fn fetch(&self, query: &VideoQuery) -> impl Future<Output = Result<Vec<VideoItem>>> + Send;

    /// Exact number of rows matching the query filters.
    fn count(&self, query: &VideoQuery) -> impl Future<Output = Result<u64>> + Send;

    fn get(&self, owner: &str, id: i64) -> impl Future<Output = Result<Option<VideoItem>>> + Send;

    fn set_hidden(
        &self,
        owner: &str,
        id: i64,
        hidden: bool,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Authenticated principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: TokenUser,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    email: Option<String>,
}

/// PostgREST-backed video source.
#[derive(Clone)]
pub struct RestVideoSource {
    client: Client,
    base_url: String,
    anon_key: String,
    table: String,
    access_token: Option<String>,
}

impl RestVideoSource {
    pub fn new(client: Client, base_url: &str, anon_key: &str, table: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            table: table.to_string(),
            access_token: None,
        }
    }

    pub fn with_session(mut self, session: &Session) -> Self {
        self.access_token = Some(session.access_token.clone());
        self
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.anon_key);
        request.header("apikey", &self.anon_key).bearer_auth(token)
    }

    /// Password sign-in against the backend's auth endpoint.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.base_url);
        let res = self
            .client
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(Error::fetch)?
            .error_for_status()
            .map_err(Error::fetch)?;

        let token: TokenResponse = res.json().await.map_err(Error::fetch)?;
        Ok(Session {
            access_token: token.access_token,
            user_id: token.user.id,
            email: token.user.email,
        })
    }
}

/// Total from a `Content-Range` value such as `0-9/42` or `*/42`.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

impl VideoSource for RestVideoSource {
    async fn fetch(&self, query: &VideoQuery) -> Result<Vec<VideoItem>> {
        let request = self.client.get(self.table_url()).query(&query.to_params(true));
        let res = self
            .authorize(request)
            .send()
            .await
            .map_err(Error::fetch)?
            .error_for_status()
            .map_err(Error::fetch)?;
        res.json().await.map_err(Error::fetch)
    }

    async fn count(&self, query: &VideoQuery) -> Result<u64> {
        let request = self
            .client
            .head(self.table_url())
            .query(&query.to_params(false))
            .header("Prefer", "count=exact");
        let res = self
            .authorize(request)
            .send()
            .await
            .map_err(Error::fetch)?
            .error_for_status()
            .map_err(Error::fetch)?;

        res.headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total)
            .ok_or_else(|| Error::fetch("response carried no row count"))
    }

    async fn get(&self, owner: &str, id: i64) -> Result<Option<VideoItem>> {
        let params = [
            ("select", "*".to_string()),
            ("user_id", format!("eq.{}", owner)),
            ("id", format!("eq.{}", id)),
            ("limit", "1".to_string()),
        ];
        let request = self.client.get(self.table_url()).query(&params);
        let res = self
            .authorize(request)
            .send()
            .await
            .map_err(Error::fetch)?
            .error_for_status()
            .map_err(Error::fetch)?;
        let rows: Vec<VideoItem> = res.json().await.map_err(Error::fetch)?;
        Ok(rows.into_iter().next())
    }

    async fn set_hidden(&self, owner: &str, id: i64, hidden: bool) -> Result<()> {
        let params = [
            ("user_id", format!("eq.{}", owner)),
            ("id", format!("eq.{}", id)),
        ];
        let request = self
            .client
            .patch(self.table_url())
            .query(&params)
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({ "is_hidden": hidden }));
        self.authorize(request)
            .send()
            .await
            .map_err(Error::fetch)?
            .error_for_status()
            .map_err(Error::fetch)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::memory::item;
    use super::*;

    #[test]
    fn content_range_parsing() {
        assert_eq!(content_range_total("0-9/42"), Some(42));
        assert_eq!(content_range_total("*/0"), Some(0));
        assert_eq!(content_range_total("*/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }

    #[test]
    fn eligible_query_params() {
        let query = VideoQuery::eligible("u1", Category::Liked)
            .after(5)
            .excluding(5)
            .limit(1);
        let params = query.to_params(true);
        assert!(params.contains(&("user_id", "eq.u1".to_string())));
        assert!(params.contains(&("type", "eq.liked".to_string())));
        assert!(params.contains(&("is_hidden", "eq.false".to_string())));
        assert!(params.contains(&("video_src", "neq.".to_string())));
        assert!(params.contains(&("id", "gt.5".to_string())));
        assert!(params.contains(&("id", "neq.5".to_string())));
        assert!(params.contains(&("order", "id.asc".to_string())));
        assert!(params.contains(&("limit", "1".to_string())));

        let unpaged = query.to_params(false);
        assert!(!unpaged.iter().any(|(k, _)| *k == "order" || *k == "limit"));
    }

    #[test]
    fn query_matching() {
        let mut hidden = item(2, Category::Liked);
        hidden.is_hidden = true;
        let mut other_owner = item(3, Category::Liked);
        other_owner.user_id = "u2".into();

        let query = VideoQuery::eligible("u1", Category::Liked);
        assert!(query.matches(&item(1, Category::Liked)));
        assert!(!query.matches(&hidden));
        assert!(!query.matches(&other_owner));
        assert!(!query.matches(&item(4, Category::Noted)));

        let titled = VideoQuery::eligible("u1", Category::Liked).title_contains("VIDEO 1");
        assert!(titled.matches(&item(1, Category::Liked)));
        assert!(!titled.matches(&item(5, Category::Liked)));
    }

    #[tokio::test]
    async fn rest_source_fetch_and_count() {
        use crate::testing::{CannedResponse, TestServer};

        let body = serde_json::json!([{
            "id": 9, "user_id": "u1", "type": "liked", "title": "x",
            "video_src": "https://cdn.example/9.mp4", "image_src": null, "is_hidden": false
        }])
        .to_string();
        let server = TestServer::start(vec![
            CannedResponse::ok(body.into_bytes()).with_header("Content-Type", "application/json"),
            CannedResponse::ok(Vec::new()).with_header("Content-Range", "*/3"),
        ])
        .await;

        let source = RestVideoSource::new(Client::new(), &server.url(""), "anon", "videos");
        let query = VideoQuery::eligible("u1", Category::Liked).after(5).limit(1);

        let rows = source.fetch(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 9);
        assert_eq!(source.count(&query).await.unwrap(), 3);

        let requests = server.requests();
        assert!(requests[0].starts_with("GET /rest/v1/videos?"));
        assert!(requests[0].contains("id=gt.5"));
        assert!(requests[1].starts_with("HEAD /rest/v1/videos?"));
    }

    #[tokio::test]
    async fn rest_source_maps_failures_to_transient() {
        let source = RestVideoSource::new(Client::new(), "http://127.0.0.1:9", "anon", "videos");
        let err = source
            .fetch(&VideoQuery::eligible("u1", Category::Liked))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransientFetch(_)));
    }
}
