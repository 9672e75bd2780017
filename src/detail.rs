use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::capability::{BrowseCapability, CapabilityError, RawFields};
use crate::classifier::CandidateDescriptor;
use crate::config::CrawlConfig;
use crate::db::ClassRecord;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s*min").unwrap());

// Keys the capability reports detail fields under.
pub const FIELD_TITLE: &str = "title";
pub const FIELD_SUBTITLE: &str = "subtitle";
pub const FIELD_DURATION: &str = "duration";
pub const FIELD_SPANS: &str = "spans";
pub const FIELD_URL: &str = "url";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DetailError {
    /// The surface didn't load in time. Worth another attempt.
    #[error("details for {identifier} unavailable: {reason}")]
    DetailUnavailable { identifier: String, reason: String },
    /// The surface opened but a required field is absent.
    #[error("details for {identifier} missing {field}")]
    FieldMissing {
        identifier: String,
        field: &'static str,
    },
    #[error("details for {identifier} failed: {reason}")]
    Interface { identifier: String, reason: String },
}

impl DetailError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DetailError::DetailUnavailable { .. })
    }

    fn from_capability(identifier: &str, err: CapabilityError) -> Self {
        match err {
            CapabilityError::Timeout(what) => DetailError::DetailUnavailable {
                identifier: identifier.to_string(),
                reason: format!("timed out waiting for {what}"),
            },
            CapabilityError::Interface(reason) => DetailError::Interface {
                identifier: identifier.to_string(),
                reason,
            },
        }
    }
}

/// Open the detail surface for `candidate`, read it, and close it again.
///
/// The surface is closed on every path once it has been opened; a failing close
/// is logged and does not change the outcome.
pub async fn extract<C>(
    feed: &mut C,
    candidate: &CandidateDescriptor,
    cfg: &CrawlConfig,
) -> Result<ClassRecord, DetailError>
where
    C: BrowseCapability + ?Sized,
{
    let id = candidate.identifier.as_str();
    let handle = match tokio::time::timeout(cfg.detail_timeout, feed.open_detail(id)).await {
        Ok(opened) => opened.map_err(|e| DetailError::from_capability(id, e))?,
        Err(_) => return Err(unavailable(id, cfg)),
    };

    let read = tokio::time::timeout(cfg.detail_timeout, feed.read_detail_fields(&handle)).await;

    if let Err(e) = feed.close_detail(handle).await {
        warn!("Could not close details for {}: {}", id, e);
    }

    let fields = match read {
        Ok(Ok(fields)) => fields,
        Ok(Err(e)) => return Err(DetailError::from_capability(id, e)),
        Err(_) => return Err(unavailable(id, cfg)),
    };

    let record = parse_fields(&fields, candidate, cfg)?;
    debug!(
        "Read {} | {} | {} min | rating {}",
        record.title, record.instructor, record.duration_minutes, record.difficulty_rating
    );
    Ok(record)
}

fn unavailable(identifier: &str, cfg: &CrawlConfig) -> DetailError {
    DetailError::DetailUnavailable {
        identifier: identifier.to_string(),
        reason: format!("no details after {:.1}s", cfg.detail_timeout.as_secs_f64()),
    }
}

/// Turn raw detail fields into a complete record.
pub fn parse_fields(
    fields: &RawFields,
    candidate: &CandidateDescriptor,
    cfg: &CrawlConfig,
) -> Result<ClassRecord, DetailError> {
    let missing = |field| DetailError::FieldMissing {
        identifier: candidate.identifier.clone(),
        field,
    };
    let get = |key: &str| fields.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    let title = get(FIELD_TITLE)
        .map(str::to_string)
        .unwrap_or_else(|| candidate.title.clone());

    let instructor = get(FIELD_SUBTITLE)
        .and_then(instructor_from_subtitle)
        .ok_or_else(|| missing("instructor"))?;

    let duration_minutes = get(FIELD_DURATION)
        .and_then(duration_from_pill)
        .or_else(|| leading_minutes(&title))
        .ok_or_else(|| missing("duration"))?;

    let difficulty_rating = get(FIELD_SPANS)
        .and_then(rating_from_spans)
        .ok_or_else(|| missing("difficulty_rating"))?;

    let url = get(FIELD_URL)
        .map(str::to_string)
        .unwrap_or_else(|| cfg.details_url(&candidate.identifier));

    Ok(ClassRecord {
        identifier: candidate.identifier.clone(),
        title,
        instructor,
        duration_minutes,
        difficulty_rating,
        class_type: cfg.class_type.clone(),
        // The details surface carries no air date; the tile's is authoritative.
        original_air_date: candidate.approximate_date,
        url,
    })
}

/// "Matt Wilpers · Cycling · 45 min" → "Matt Wilpers". Legacy classes have no separator.
fn instructor_from_subtitle(subtitle: &str) -> Option<String> {
    let name = subtitle.split('·').next().unwrap_or(subtitle).trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn duration_from_pill(pill: &str) -> Option<i64> {
    DURATION_RE.captures(pill)?[1].parse().ok()
}

fn leading_minutes(title: &str) -> Option<i64> {
    title.split_whitespace().next()?.parse().ok()
}

/// First span reading like a decimal in 0..=10. Skips "+" counters such as "4.5K+".
fn rating_from_spans(spans: &str) -> Option<f64> {
    spans
        .lines()
        .map(str::trim)
        .filter(|t| t.contains('.') && !t.contains('+'))
        .filter_map(|t| t.parse::<f64>().ok())
        .find(|v| (0.0..=10.0).contains(v))
}
