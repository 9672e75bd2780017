use std::path::PathBuf;
use std::time::Duration;

pub const CATALOG_URL: &str = "https://members.onepeloton.com/classes/cycling";
pub const LOGIN_URL: &str = "https://members.onepeloton.com/login";
pub const WEBDRIVER_URL: &str = "http://localhost:4444";
pub const CLASS_TYPE: &str = "Power Zone";
pub const DB_PATH: &str = "data/classes.sqlite";

pub const MAX_ITEMS: usize = 10_000;
pub const STOP_THRESHOLD: usize = 10;
const SCROLL_RETRIES: u32 = 3;
const SCROLL_WAIT_MS: u64 = 2000;
const DETAIL_ATTEMPTS: u32 = 3;
const DETAIL_TIMEOUT_MS: u64 = 12_000;
const BASE_BACKOFF_MS: u64 = 500;

/// Tunables for one crawl run. Everything the window doesn't pin down lives here.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub catalog_url: String,
    /// Catalog filter applied before crawling; persisted as each record's class type.
    pub class_type: String,
    pub db_path: PathBuf,
    pub webdriver_url: String,
    pub headless: bool,
    /// Scroll attempts without new tiles before the feed counts as exhausted.
    pub scroll_retries: u32,
    pub scroll_wait: Duration,
    /// Total attempts per item while the detail surface keeps timing out.
    pub detail_attempts: u32,
    pub detail_timeout: Duration,
    /// Doubled after every failed detail attempt.
    pub base_backoff: Duration,
    pub skip_existing: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            catalog_url: CATALOG_URL.to_string(),
            class_type: CLASS_TYPE.to_string(),
            db_path: PathBuf::from(DB_PATH),
            webdriver_url: WEBDRIVER_URL.to_string(),
            headless: false,
            scroll_retries: SCROLL_RETRIES,
            scroll_wait: Duration::from_millis(SCROLL_WAIT_MS),
            detail_attempts: DETAIL_ATTEMPTS,
            detail_timeout: Duration::from_millis(DETAIL_TIMEOUT_MS),
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
            skip_existing: false,
        }
    }
}

impl CrawlConfig {
    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Canonical details URL for a class, used when the surface doesn't report its own.
    pub fn details_url(&self, identifier: &str) -> String {
        format!(
            "{}?modal=classDetailsModal&classId={}",
            self.catalog_url, identifier
        )
    }
}
