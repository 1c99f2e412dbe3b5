//! Notion REST implementation of [`DocumentClient`].
//!
//! # Requests
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | `get_node` (page) | `GET /pages/{id}` |
//! | `get_node` (database) | `GET /databases/{id}` |
//! | `get_node` (block) | `GET /blocks/{id}` |
//! | `list_children` (page or block) | `GET /blocks/{id}/children`, cursor-paginated |
//! | `list_children` (database) | `POST /databases/{id}/query`, cursor-paginated |
//!
//! `child_page` blocks are resolved through `GET /pages/{id}` so the
//! returned record carries the page's own URL and `last_edited_time`.
//!
//! Every request passes through a sliding-window rate limiter
//! (`notion.requests_per_second`, default 3). A single attempt is made per
//! request; the caller owns retry. Status mapping:
//!
//! - 404 → `SourceNotFound`
//! - 429, 5xx, network errors → `SourceUnavailable`
//! - other 4xx → `SourceRejected`
//!
//! Archived or trashed pages and databases are reported as
//! `SourceNotFound` so they leave the index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use notion_index_core::models::{NodeKind, SourceNode};
use notion_index_core::source::DocumentClient;
use notion_index_core::{Error, Result};

use crate::config::NotionConfig;

/// Sliding one-second window admitting at most `per_second` requests.
pub struct RateLimiter {
    per_second: usize,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self {
            per_second: per_second.max(1) as usize,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a request may be sent, then record it.
    pub async fn acquire(&self) {
        let mut window = self.window.lock().await;
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(1))
        {
            window.pop_front();
        }
        if window.len() >= self.per_second {
            if let Some(oldest) = window.pop_front() {
                tokio::time::sleep_until(oldest + Duration::from_secs(1)).await;
            }
        }
        window.push_back(Instant::now());
    }
}

pub struct NotionClient {
    http: reqwest::Client,
    base_url: String,
    api_version: String,
    token: String,
    page_size: u32,
    limiter: RateLimiter,
    /// Ids known to be databases; their children come from a query.
    databases: StdMutex<HashSet<String>>,
}

impl NotionClient {
    pub fn new(config: &NotionConfig, token: String, timeout: Duration) -> anyhow::Result<Self> {
        if token.is_empty() {
            anyhow::bail!("NOTION_TOKEN environment variable not set");
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            token,
            page_size: config.page_size.clamp(1, 100),
            limiter: RateLimiter::new(config.requests_per_second),
            databases: StdMutex::new(HashSet::new()),
        })
    }

    /// Build a client from `NOTION_TOKEN`.
    pub fn from_env(config: &NotionConfig, timeout: Duration) -> anyhow::Result<Self> {
        Self::new(config, std::env::var("NOTION_TOKEN").unwrap_or_default(), timeout)
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<Value> {
        self.limiter.acquire().await;
        let url = format!("{}/{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .header("Notion-Version", &self.api_version);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::source_unavailable(format!("{}: {}", path, e)))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| Error::source_unavailable(format!("{}: invalid JSON: {}", path, e)));
        }
        let text = resp.text().await.unwrap_or_default();
        let msg = format!("{} returned {}: {}", path, status, text);
        Err(match status.as_u16() {
            404 => Error::SourceNotFound(msg),
            429 => Error::SourceUnavailable(msg),
            s if s >= 500 => Error::SourceUnavailable(msg),
            _ => Error::SourceRejected(msg),
        })
    }

    fn is_database(&self, id: &str) -> bool {
        self.databases
            .lock()
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    fn remember_database(&self, id: &str) {
        if let Ok(mut set) = self.databases.lock() {
            set.insert(id.to_string());
        }
    }

    async fn paginate(&self, id: &str, database: bool) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = if database {
                let mut body = serde_json::json!({ "page_size": self.page_size });
                if let Some(c) = &cursor {
                    body["start_cursor"] = Value::String(c.clone());
                }
                self.request(
                    reqwest::Method::POST,
                    &format!("databases/{}/query", id),
                    Some(&body),
                )
                .await?
            } else {
                let mut path = format!("blocks/{}/children?page_size={}", id, self.page_size);
                if let Some(c) = &cursor {
                    path.push_str(&format!("&start_cursor={}", c));
                }
                self.request(reqwest::Method::GET, &path, None).await?
            };
            if let Some(items) = page.get("results").and_then(Value::as_array) {
                results.extend(items.iter().cloned());
            }
            let has_more = page.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            cursor = page
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if !has_more || cursor.is_none() {
                break;
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl DocumentClient for NotionClient {
    async fn get_node(&self, node_id: &str) -> Result<SourceNode> {
        match self
            .request(reqwest::Method::GET, &format!("pages/{}", node_id), None)
            .await
        {
            Ok(page) if is_archived(&page) => return Err(Error::source_not_found(node_id)),
            Ok(page) => return parse_page(&page, None),
            Err(Error::SourceNotFound(_)) | Err(Error::SourceRejected(_)) => {}
            Err(e) => return Err(e),
        }
        match self
            .request(reqwest::Method::GET, &format!("databases/{}", node_id), None)
            .await
        {
            Ok(db) if is_archived(&db) => return Err(Error::source_not_found(node_id)),
            Ok(db) => {
                self.remember_database(node_id);
                return parse_database(&db, None);
            }
            Err(Error::SourceNotFound(_)) | Err(Error::SourceRejected(_)) => {}
            Err(e) => return Err(e),
        }
        let block = self
            .request(reqwest::Method::GET, &format!("blocks/{}", node_id), None)
            .await?;
        parse_block(&block, None)
    }

    async fn list_children(&self, node_id: &str) -> Result<Vec<SourceNode>> {
        if self.is_database(node_id) {
            let pages = self.paginate(node_id, true).await?;
            return pages
                .iter()
                .map(|p| parse_page(p, Some(node_id)))
                .collect();
        }

        let blocks = self.paginate(node_id, false).await?;
        let mut children = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
            let id = str_field(block, "id")?;
            match block_type {
                "child_page" => {
                    let page = self
                        .request(reqwest::Method::GET, &format!("pages/{}", id), None)
                        .await?;
                    if is_archived(&page) {
                        debug!(page_id = id, "skipping archived child page");
                        continue;
                    }
                    children.push(parse_page(&page, Some(node_id))?);
                }
                "child_database" => {
                    self.remember_database(id);
                    children.push(parse_block(block, Some(node_id))?);
                }
                _ => children.push(parse_block(block, Some(node_id))?),
            }
        }
        debug!(node_id, count = children.len(), "listed children");
        Ok(children)
    }
}

// ============ Payload parsing ============

fn str_field<'a>(value: &'a Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::SourceRejected(format!("malformed payload: missing '{}'", key)))
}

fn edited_at(value: &Value) -> Result<DateTime<Utc>> {
    let raw = str_field(value, "last_edited_time")?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::SourceRejected(format!("bad last_edited_time '{}': {}", raw, e)))
}

/// Concatenate the `plain_text` of a rich text array.
fn plain_text(rich: Option<&Value>) -> String {
    rich.and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Archived and trashed pages still answer 200; treat them as gone.
fn is_archived(value: &Value) -> bool {
    ["archived", "in_trash"]
        .iter()
        .any(|key| value.get(*key).and_then(Value::as_bool).unwrap_or(false))
}

fn parent_of(value: &Value) -> Option<String> {
    let parent = value.get("parent")?;
    let kind = parent.get("type")?.as_str()?;
    parent.get(kind)?.as_str().map(str::to_string)
}

fn page_url(value: &Value, id: &str) -> String {
    value
        .get("url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("https://www.notion.so/{}", id.replace('-', "")))
}

/// Page title: the property of type `title`, whatever its name.
fn page_title(page: &Value) -> String {
    page.get("properties")
        .and_then(Value::as_object)
        .and_then(|props| {
            props
                .values()
                .find(|p| p.get("type").and_then(Value::as_str) == Some("title"))
        })
        .map(|p| plain_text(p.get("title")))
        .unwrap_or_default()
}

fn parse_page(page: &Value, listed_under: Option<&str>) -> Result<SourceNode> {
    let id = str_field(page, "id")?;
    Ok(SourceNode {
        node_id: id.to_string(),
        parent_id: listed_under.map(str::to_string).or_else(|| parent_of(page)),
        kind: NodeKind::Page {
            title: page_title(page),
        },
        has_children: true,
        last_edited_at: edited_at(page)?,
        url: Some(page_url(page, id)),
    })
}

fn parse_database(db: &Value, listed_under: Option<&str>) -> Result<SourceNode> {
    let id = str_field(db, "id")?;
    Ok(SourceNode {
        node_id: id.to_string(),
        parent_id: listed_under.map(str::to_string).or_else(|| parent_of(db)),
        kind: NodeKind::Database {
            title: plain_text(db.get("title")),
        },
        has_children: true,
        last_edited_at: edited_at(db)?,
        url: Some(page_url(db, id)),
    })
}

/// Map one block payload onto a [`NodeKind`] variant.
pub fn block_kind(block: &Value) -> NodeKind {
    let block_type = block.get("type").and_then(Value::as_str).unwrap_or("unknown");
    let body = block.get(block_type);
    let text = || plain_text(body.and_then(|b| b.get("rich_text")));
    match block_type {
        "paragraph" => NodeKind::Paragraph { text: text() },
        "heading_1" => NodeKind::Heading { level: 1, text: text() },
        "heading_2" => NodeKind::Heading { level: 2, text: text() },
        "heading_3" => NodeKind::Heading { level: 3, text: text() },
        "bulleted_list_item" => NodeKind::BulletedListItem { text: text() },
        "numbered_list_item" => NodeKind::NumberedListItem { text: text() },
        "to_do" => NodeKind::ToDo {
            text: text(),
            checked: body
                .and_then(|b| b.get("checked"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "toggle" => NodeKind::Toggle { text: text() },
        "quote" => NodeKind::Quote { text: text() },
        "callout" => NodeKind::Callout { text: text() },
        "code" => NodeKind::Code {
            language: body
                .and_then(|b| b.get("language"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            text: text(),
        },
        "divider" => NodeKind::Divider,
        "table" => NodeKind::Table,
        "table_row" => NodeKind::TableRow {
            cells: body
                .and_then(|b| b.get("cells"))
                .and_then(Value::as_array)
                .map(|cells| cells.iter().map(|c| plain_text(Some(c))).collect())
                .unwrap_or_default(),
        },
        "child_page" => NodeKind::Page {
            title: body
                .and_then(|b| b.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        },
        "child_database" => NodeKind::Database {
            title: body
                .and_then(|b| b.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        },
        other => NodeKind::Unsupported {
            block_type: other.to_string(),
        },
    }
}

fn parse_block(block: &Value, listed_under: Option<&str>) -> Result<SourceNode> {
    let id = str_field(block, "id")?;
    let kind = block_kind(block);
    let has_children = kind.is_container()
        || block
            .get("has_children")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    let url = kind.is_container().then(|| page_url(block, id));
    Ok(SourceNode {
        node_id: id.to_string(),
        parent_id: listed_under.map(str::to_string).or_else(|| parent_of(block)),
        kind,
        has_children,
        last_edited_at: edited_at(block)?,
        url,
    })
}
