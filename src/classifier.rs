use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use url::Url;

use crate::capability::RawTile;

// Tiles print the air date as "Tue 11/25/25 @ 1:00 PM"; some legacy tiles use a 4-digit year.
static TILE_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2}/\d{1,2}/(?:\d{4}|\d{2}))\b").unwrap());
static TILE_BASE: LazyLock<Url> =
    LazyLock::new(|| Url::parse("https://members.onepeloton.com/").unwrap());

/// Lightweight description of a tile, enough to decide what to do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDescriptor {
    pub identifier: String,
    pub title: String,
    pub approximate_date: NaiveDate,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TileError {
    /// Rendered, but no identifier or date could be read off it.
    #[error("malformed tile #{index}: {reason}")]
    Malformed {
        index: usize,
        identifier: Option<String>,
        reason: &'static str,
    },
    /// Still rendering; look again next pass.
    #[error("tile #{index} not fully rendered")]
    Incomplete { index: usize },
}

impl TileError {
    /// Key used to remember a malformed tile across passes.
    pub fn tile_key(&self) -> String {
        match self {
            TileError::Malformed {
                identifier: Some(id),
                ..
            } => id.clone(),
            TileError::Malformed { index, .. } | TileError::Incomplete { index } => {
                format!("#{index}")
            }
        }
    }
}

pub fn classify(tile: &RawTile) -> Result<CandidateDescriptor, TileError> {
    let text = tile.text.trim();
    if text.is_empty() {
        return Err(TileError::Incomplete { index: tile.index });
    }
    // A rendered tile with no title element at all means the layout changed.
    let Some(title) = tile.title.as_deref().map(str::trim) else {
        return Err(TileError::Malformed {
            index: tile.index,
            identifier: tile.href.as_deref().and_then(identifier_from_href),
            reason: "no title on tile",
        });
    };
    if title.is_empty() {
        return Err(TileError::Incomplete { index: tile.index });
    }

    let identifier = tile.href.as_deref().and_then(identifier_from_href);
    let Some(identifier) = identifier else {
        return Err(TileError::Malformed {
            index: tile.index,
            identifier: None,
            reason: "no class id in tile link",
        });
    };

    let Some(approximate_date) = parse_tile_date(text) else {
        return Err(TileError::Malformed {
            index: tile.index,
            identifier: Some(identifier),
            reason: "no air date on tile",
        });
    };

    Ok(CandidateDescriptor {
        identifier,
        title: title.to_string(),
        approximate_date,
    })
}

/// `classId` query parameter if present, otherwise the last path segment.
pub fn identifier_from_href(href: &str) -> Option<String> {
    let url = TILE_BASE.join(href.trim()).ok()?;
    if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == "classId") {
        return Some(id.into_owned()).filter(|id| !id.is_empty());
    }
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}

fn parse_tile_date(text: &str) -> Option<NaiveDate> {
    let caps = TILE_DATE_RE.captures(text)?;
    let raw = &caps[1];
    let year_len = raw.rsplit('/').next().map(str::len).unwrap_or(0);
    let fmt = if year_len == 4 { "%m/%d/%Y" } else { "%m/%d/%y" };
    NaiveDate::parse_from_str(raw, fmt).ok()
}
