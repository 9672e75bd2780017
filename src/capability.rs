//! The narrow browsing surface the crawl drives.
//!
//! Everything the controller knows about the catalog comes through
//! [`BrowseCapability`]; the WebDriver session in `browser.rs` is one
//! implementation, the scripted feed in the crawl tests is another.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// The awaited element or content did not show up in time. Always retryable.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("browser interface error: {0}")]
    Interface(String),
}

impl CapabilityError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CapabilityError::Timeout(_))
    }
}

pub type CapResult<T> = std::result::Result<T, CapabilityError>;

/// Snapshot of one rendered catalog tile, as read off the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawTile {
    /// Position in the feed at read time.
    pub index: usize,
    /// Link target of the tile, carries the class id.
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Full visible text of the tile, including the air-date line.
    #[serde(default)]
    pub text: String,
}

/// An opened detail surface. Must be handed back to `close_detail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailHandle {
    pub identifier: String,
}

/// Raw detail fields keyed by name (`title`, `subtitle`, `duration`, `spans`, `url`, ...).
pub type RawFields = HashMap<String, String>;

#[async_trait]
pub trait BrowseCapability: Send {
    async fn navigate_to(&mut self, url: &str) -> CapResult<()>;

    /// Scroll to the bottom and wait; `true` when new tiles appeared.
    async fn scroll_to_load_more(&mut self) -> CapResult<bool>;

    async fn read_visible_tiles(&mut self) -> CapResult<Vec<RawTile>>;

    async fn open_detail(&mut self, identifier: &str) -> CapResult<DetailHandle>;

    async fn read_detail_fields(&mut self, handle: &DetailHandle) -> CapResult<RawFields>;

    async fn close_detail(&mut self, handle: DetailHandle) -> CapResult<()>;
}
