//! Date-window crawl controller.
//!
//! Drives one browsing session through a newest-first catalog: read tiles,
//! bucket each by date, extract the in-window ones, and stop once the limit is
//! hit, enough consecutive old tiles went by, or the feed stops growing.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::ProgressBar;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::capability::{BrowseCapability, CapabilityError};
use crate::classifier::{self, CandidateDescriptor, TileError};
use crate::config::CrawlConfig;
use crate::db::{ClassRecord, ClassStore, StoreError, UpsertOutcome};
use crate::detail::{self, DetailError};
use crate::window::{CrawlWindow, WindowPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scrolling,
    Classifying,
    FastForwarding,
    Extracting,
    Counting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    LimitReached,
    PastWindow,
    ExhaustedFeed,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::LimitReached => "LimitReached",
            StopReason::PastWindow => "PastWindow",
            StopReason::ExhaustedFeed => "ExhaustedFeed",
            StopReason::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SkipReason {
    MalformedTile,
    DetailUnavailable,
    FieldMissing,
    DetailFailed,
}

/// A per-item failure kept for the end-of-run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub identifier: String,
    pub reason: SkipReason,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("catalog feed failed: {0}")]
    Feed(#[source] CapabilityError),
    #[error("could not persist {identifier}: {source}")]
    Persistence {
        identifier: String,
        #[source]
        source: StoreError,
    },
}

/// Working state of one run. Dropped when the run ends.
#[derive(Debug)]
pub struct CrawlState {
    pub items_extracted: usize,
    /// Old tiles seen in a row; any in-window tile resets it.
    pub consecutive_before_start: usize,
    pub seen_identifiers: HashSet<String>,
    pub phase: Phase,
    fast_forwarded: HashSet<String>,
    malformed: HashSet<String>,
}

impl CrawlState {
    fn new() -> Self {
        Self {
            items_extracted: 0,
            consecutive_before_start: 0,
            seen_identifiers: HashSet::new(),
            phase: Phase::Scrolling,
            fast_forwarded: HashSet::new(),
            malformed: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlSummary {
    pub passes: usize,
    pub extracted: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Tiles newer than the window that were scrolled past.
    pub fast_forwarded: usize,
    /// Tiles older than the window that counted toward the stop rule.
    pub past_window: usize,
    pub already_stored: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub failures: Vec<ItemFailure>,
    pub stop_reason: Option<StopReason>,
}

impl CrawlSummary {
    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }
}

pub struct Controller<'a, C: ?Sized, S: ?Sized> {
    feed: &'a mut C,
    store: &'a mut S,
    window: CrawlWindow,
    cfg: &'a CrawlConfig,
    cancel: Arc<AtomicBool>,
    progress: ProgressBar,
    state: CrawlState,
    summary: CrawlSummary,
}

impl<'a, C, S> Controller<'a, C, S>
where
    C: BrowseCapability + ?Sized,
    S: ClassStore + ?Sized,
{
    pub fn new(feed: &'a mut C, store: &'a mut S, window: CrawlWindow, cfg: &'a CrawlConfig) -> Self {
        Self {
            feed,
            store,
            window,
            cfg,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: ProgressBar::hidden(),
            state: CrawlState::new(),
            summary: CrawlSummary::default(),
        }
    }

    /// Checked between scroll passes; setting it stops the run with `Cancelled`.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn with_progress(mut self, pb: ProgressBar) -> Self {
        self.progress = pb;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> &CrawlState {
        &self.state
    }

    pub fn summary(&self) -> &CrawlSummary {
        &self.summary
    }

    pub async fn run(&mut self) -> Result<StopReason, CrawlError> {
        info!(
            "Crawling {} → {} (max {}, stop after {} old in a row)",
            self.window.start_date, self.window.end_date, self.window.max_items, self.window.stop_threshold
        );

        let result = match self.feed.navigate_to(&self.cfg.catalog_url).await {
            Ok(()) => self.drive().await,
            Err(e) => Err(CrawlError::Feed(e)),
        };
        self.set_phase(Phase::Stopped);

        match result {
            Ok(reason) => {
                self.summary.stop_reason = Some(reason);
                info!(
                    "Stopped ({}): {} extracted, {} skipped after {} passes",
                    reason,
                    self.summary.extracted,
                    self.summary.total_skipped(),
                    self.summary.passes
                );
                Ok(reason)
            }
            Err(e) => {
                error!("Crawl aborted after {} extracted: {}", self.summary.extracted, e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<StopReason, CrawlError> {
        // The first pass looks at whatever rendered on load before scrolling.
        let mut first = true;
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                info!("Cancellation requested, stopping between passes");
                return Ok(StopReason::Cancelled);
            }

            let grew = if first { true } else { self.load_more().await? };
            first = false;

            if let Some(reason) = self.pass().await? {
                return Ok(reason);
            }
            if !grew {
                return Ok(StopReason::ExhaustedFeed);
            }
        }
    }

    /// Scroll until new tiles show up, at most `scroll_retries` times.
    async fn load_more(&mut self) -> Result<bool, CrawlError> {
        self.set_phase(Phase::Scrolling);
        let attempts = self.cfg.scroll_retries.max(1);
        for attempt in 1..=attempts {
            match self.feed.scroll_to_load_more().await {
                Ok(true) => return Ok(true),
                Ok(false) => debug!("No new tiles after scroll ({}/{})", attempt, attempts),
                Err(e) if e.is_timeout() => {
                    warn!("Scroll timed out ({}/{}): {}", attempt, attempts, e)
                }
                Err(e) => return Err(CrawlError::Feed(e)),
            }
        }
        info!("Feed stopped growing after {} scroll attempts", attempts);
        Ok(false)
    }

    /// Classify every visible tile and act on it. Returns a stop reason as soon as one applies.
    async fn pass(&mut self) -> Result<Option<StopReason>, CrawlError> {
        self.summary.passes += 1;
        self.set_phase(Phase::Classifying);

        let tiles = match self.feed.read_visible_tiles().await {
            Ok(tiles) => tiles,
            Err(e) if e.is_timeout() => {
                warn!("Reading tiles timed out, retrying next pass: {}", e);
                Vec::new()
            }
            Err(e) => return Err(CrawlError::Feed(e)),
        };
        debug!("Pass {}: {} tiles visible", self.summary.passes, tiles.len());

        for tile in &tiles {
            if let Some(reason) = self.stop_condition() {
                return Ok(Some(reason));
            }

            let candidate = match classifier::classify(tile) {
                Ok(c) => c,
                Err(TileError::Incomplete { index }) => {
                    trace!("Tile #{} still rendering", index);
                    continue;
                }
                Err(e) => {
                    self.note_malformed(e);
                    continue;
                }
            };

            if self.state.seen_identifiers.contains(&candidate.identifier)
                || self.state.fast_forwarded.contains(&candidate.identifier)
            {
                continue;
            }

            match self.window.position(candidate.approximate_date) {
                WindowPosition::TooNew => self.fast_forward(candidate),
                WindowPosition::InWindow => self.take(candidate).await?,
                WindowPosition::TooOld => self.count_old(candidate),
            }
            self.report_progress();
        }

        Ok(self.stop_condition())
    }

    fn stop_condition(&self) -> Option<StopReason> {
        if self.state.items_extracted >= self.window.max_items {
            Some(StopReason::LimitReached)
        } else if self.state.consecutive_before_start >= self.window.stop_threshold {
            Some(StopReason::PastWindow)
        } else {
            None
        }
    }

    fn fast_forward(&mut self, candidate: CandidateDescriptor) {
        self.set_phase(Phase::FastForwarding);
        debug!(
            "{} ({}) is newer than the window, scrolling past",
            candidate.identifier, candidate.approximate_date
        );
        self.summary.fast_forwarded += 1;
        self.state.fast_forwarded.insert(candidate.identifier);
    }

    fn count_old(&mut self, candidate: CandidateDescriptor) {
        self.set_phase(Phase::Counting);
        self.state.consecutive_before_start += 1;
        self.summary.past_window += 1;
        debug!(
            "{} ({}) is before the window ({} in a row)",
            candidate.identifier, candidate.approximate_date, self.state.consecutive_before_start
        );
        self.state.seen_identifiers.insert(candidate.identifier);
    }

    async fn take(&mut self, candidate: CandidateDescriptor) -> Result<(), CrawlError> {
        self.state.seen_identifiers.insert(candidate.identifier.clone());
        self.state.consecutive_before_start = 0;

        if self.cfg.skip_existing && self.is_stored(&candidate.identifier)? {
            debug!("{} already stored, not re-extracting", candidate.identifier);
            self.summary.already_stored += 1;
            return Ok(());
        }

        self.set_phase(Phase::Extracting);
        info!(
            "Extracting {} ({}) {}",
            candidate.identifier, candidate.approximate_date, candidate.title
        );
        match self.extract_with_retry(&candidate).await {
            Ok(record) => self.persist(&record),
            Err(e) => {
                self.note_failure(e);
                Ok(())
            }
        }
    }

    async fn extract_with_retry(&mut self, candidate: &CandidateDescriptor) -> Result<ClassRecord, DetailError> {
        let attempts = self.cfg.detail_attempts.max(1);
        let mut attempt = 0;
        loop {
            match detail::extract(&mut *self.feed, candidate, self.cfg).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let backoff = self.cfg.backoff(attempt);
                    warn!(
                        "{} (attempt {}/{}), retrying in {:.1}s",
                        e,
                        attempt + 1,
                        attempts,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn persist(&mut self, record: &ClassRecord) -> Result<(), CrawlError> {
        let outcome = self
            .store
            .upsert(record)
            .map_err(|source| CrawlError::Persistence {
                identifier: record.identifier.clone(),
                source,
            })?;
        match outcome {
            UpsertOutcome::Inserted => self.summary.inserted += 1,
            UpsertOutcome::Updated => self.summary.updated += 1,
        }
        self.state.items_extracted += 1;
        self.summary.extracted += 1;
        info!(
            "[{:?}] {} | {} | {} min | rating {}",
            outcome, record.title, record.instructor, record.duration_minutes, record.difficulty_rating
        );
        Ok(())
    }

    fn is_stored(&self, identifier: &str) -> Result<bool, CrawlError> {
        self.store
            .exists(identifier)
            .map_err(|source| CrawlError::Persistence {
                identifier: identifier.to_string(),
                source,
            })
    }

    fn note_malformed(&mut self, err: TileError) {
        let key = err.tile_key();
        if self.state.malformed.insert(key.clone()) {
            warn!("Skipping {}", err);
            *self.summary.skipped.entry(SkipReason::MalformedTile).or_default() += 1;
            self.summary.failures.push(ItemFailure {
                identifier: key,
                reason: SkipReason::MalformedTile,
                message: err.to_string(),
            });
        }
    }

    fn note_failure(&mut self, err: DetailError) {
        let (identifier, reason) = match &err {
            DetailError::DetailUnavailable { identifier, .. } => (identifier, SkipReason::DetailUnavailable),
            DetailError::FieldMissing { identifier, .. } => (identifier, SkipReason::FieldMissing),
            DetailError::Interface { identifier, .. } => (identifier, SkipReason::DetailFailed),
        };
        warn!("Skipping {}: {}", identifier, err);
        *self.summary.skipped.entry(reason).or_default() += 1;
        self.summary.failures.push(ItemFailure {
            identifier: identifier.clone(),
            reason,
            message: err.to_string(),
        });
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.state.phase != phase {
            trace!("{:?} → {:?}", self.state.phase, phase);
            self.state.phase = phase;
        }
    }

    fn report_progress(&self) {
        self.progress.set_message(format!(
            "pass {} | extracted {}/{} | old streak {}/{}",
            self.summary.passes,
            self.state.items_extracted,
            self.window.max_items,
            self.state.consecutive_before_start,
            self.window.stop_threshold,
        ));
        self.progress.tick();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::capability::{CapResult, DetailHandle, RawFields, RawTile};
    use crate::db::{fetch_classes, ListFilter, SqliteStore};
    use crate::detail::{FIELD_DURATION, FIELD_SPANS, FIELD_SUBTITLE, FIELD_TITLE};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn tile(index: usize, id: &str, date: NaiveDate) -> RawTile {
        RawTile {
            index,
            href: Some(format!("/classes/cycling?modal=classDetailsModal&classId={id}")),
            title: Some(format!("45 min Power Zone Ride {id}")),
            text: format!("45 min Power Zone Ride {id}\nMatt Wilpers\n{} @ 6:00 AM", date.format("%a %m/%d/%y")),
        }
    }

    /// Tiles in feed order, each `(id, date)`.
    fn tiles(entries: &[(&str, NaiveDate)]) -> Vec<RawTile> {
        entries.iter().enumerate().map(|(i, (id, date))| tile(i, id, *date)).collect()
    }

    /// Grow the feed `page` tiles per scroll, like infinite scroll does.
    fn paged(all: Vec<RawTile>, page: usize) -> Vec<Vec<RawTile>> {
        (1..=all.len().div_ceil(page))
            .map(|n| all[..(n * page).min(all.len())].to_vec())
            .collect()
    }

    fn good_fields(id: &str) -> RawFields {
        [
            (FIELD_TITLE, format!("45 min Power Zone Ride {id}")),
            (FIELD_SUBTITLE, "Matt Wilpers · Cycling".to_string()),
            (FIELD_DURATION, "45 min".to_string()),
            (FIELD_SPANS, "7.5".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Scripted catalog: each scroll advances to the next snapshot of visible tiles.
    #[derive(Default)]
    struct ScriptedFeed {
        snapshots: Vec<Vec<RawTile>>,
        step: usize,
        scroll_error: Option<CapabilityError>,
        detail_script: HashMap<String, VecDeque<CapResult<RawFields>>>,
        opened: Vec<String>,
        open_surfaces: usize,
        scrolls: usize,
        navigated: Vec<String>,
    }

    impl ScriptedFeed {
        fn new(snapshots: Vec<Vec<RawTile>>) -> Self {
            Self { snapshots, ..Default::default() }
        }

        fn script(mut self, id: &str, responses: Vec<CapResult<RawFields>>) -> Self {
            self.detail_script.insert(id.to_string(), responses.into());
            self
        }

        fn opens_of(&self, id: &str) -> usize {
            self.opened.iter().filter(|o| o.as_str() == id).count()
        }
    }

    #[async_trait]
    impl BrowseCapability for ScriptedFeed {
        async fn navigate_to(&mut self, url: &str) -> CapResult<()> {
            self.navigated.push(url.to_string());
            Ok(())
        }

        async fn scroll_to_load_more(&mut self) -> CapResult<bool> {
            self.scrolls += 1;
            if let Some(e) = self.scroll_error.take() {
                return Err(e);
            }
            if self.step + 1 < self.snapshots.len() {
                self.step += 1;
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn read_visible_tiles(&mut self) -> CapResult<Vec<RawTile>> {
            Ok(self.snapshots.get(self.step).cloned().unwrap_or_default())
        }

        async fn open_detail(&mut self, identifier: &str) -> CapResult<DetailHandle> {
            assert_eq!(self.open_surfaces, 0, "second detail surface opened");
            self.opened.push(identifier.to_string());
            self.open_surfaces += 1;
            Ok(DetailHandle { identifier: identifier.to_string() })
        }

        async fn read_detail_fields(&mut self, handle: &DetailHandle) -> CapResult<RawFields> {
            match self.detail_script.get_mut(&handle.identifier).and_then(|q| q.pop_front()) {
                Some(scripted) => scripted,
                None => Ok(good_fields(&handle.identifier)),
            }
        }

        async fn close_detail(&mut self, _handle: DetailHandle) -> CapResult<()> {
            self.open_surfaces -= 1;
            Ok(())
        }
    }

    /// Fails the n-th upsert (1-based) as if the database went away.
    struct FlakyStore {
        inner: SqliteStore,
        fail_on: usize,
        calls: usize,
    }

    impl ClassStore for FlakyStore {
        fn upsert(&mut self, record: &ClassRecord) -> Result<UpsertOutcome, StoreError> {
            self.calls += 1;
            if self.calls == self.fail_on {
                return Err(StoreError::Unavailable("database is locked".into()));
            }
            self.inner.upsert(record)
        }

        fn exists(&self, identifier: &str) -> Result<bool, StoreError> {
            self.inner.exists(identifier)
        }
    }

    fn cfg() -> CrawlConfig {
        CrawlConfig {
            base_backoff: Duration::ZERO,
            ..CrawlConfig::default()
        }
    }

    fn november(max_items: usize, threshold: usize) -> CrawlWindow {
        CrawlWindow::new(d(2025, 11, 1), d(2025, 11, 30), max_items, threshold).unwrap()
    }

    fn stored_ids(store: &SqliteStore) -> Vec<String> {
        let mut ids: Vec<String> = fetch_classes(
            store.conn(),
            &ListFilter { start: None, end: None, instructor: None, limit: 1000 },
        )
        .unwrap()
        .into_iter()
        .map(|r| r.identifier)
        .collect();
        ids.sort();
        ids
    }

    fn five_then_twelve_old() -> Vec<RawTile> {
        let mut entries: Vec<(String, NaiveDate)> =
            (0..5).map(|i| (format!("in{i}"), d(2025, 11, 20 - i))).collect();
        entries.extend((0..12).map(|i| (format!("old{i}"), d(2025, 10, 15))));
        let refs: Vec<(&str, NaiveDate)> = entries.iter().map(|(id, dt)| (id.as_str(), *dt)).collect();
        tiles(&refs)
    }

    #[tokio::test]
    async fn stops_past_window_on_tenth_old_tile() {
        let all = five_then_twelve_old();
        let mut feed = ScriptedFeed::new(vec![all[..5].to_vec(), all.clone()]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        let reason = ctl.run().await.unwrap();
        assert_eq!(reason, StopReason::PastWindow);
        assert_eq!(ctl.state().consecutive_before_start, 10);
        assert_eq!(ctl.state().phase, Phase::Stopped);
        assert_eq!(ctl.summary().past_window, 10);
        assert_eq!(ctl.summary().extracted, 5);
        assert!(!ctl.state().seen_identifiers.contains("old10"));

        assert_eq!(stored_ids(&store).len(), 5);
        assert_eq!(feed.open_surfaces, 0);
        assert_eq!(feed.navigated, vec![cfg.catalog_url.clone()]);
    }

    #[tokio::test]
    async fn newer_tiles_are_never_extracted_or_counted() {
        let all = tiles(&[
            ("new0", d(2025, 12, 5)),
            ("in0", d(2025, 11, 29)),
            ("old0", d(2025, 10, 30)),
            ("old1", d(2025, 10, 29)),
            ("new1", d(2025, 12, 1)),
            ("new2", d(2026, 1, 1)),
            ("old2", d(2025, 10, 28)),
            ("in1", d(2025, 11, 2)),
        ]);
        let mut feed = ScriptedFeed::new(paged(all, 3));
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 3), &cfg);

        // new1/new2 sit between old tiles and must not break the streak
        assert_eq!(ctl.run().await.unwrap(), StopReason::PastWindow);
        assert_eq!(ctl.summary().fast_forwarded, 3);
        assert_eq!(ctl.summary().past_window, 3);
        assert_eq!(ctl.summary().extracted, 1);
        assert!(feed.opened.iter().all(|id| !id.starts_with("new")));
        assert_eq!(feed.opened, vec!["in0".to_string()]);
    }

    #[tokio::test]
    async fn in_window_tile_resets_old_streak() {
        let all = tiles(&[
            ("old0", d(2025, 10, 31)),
            ("old1", d(2025, 10, 30)),
            ("in0", d(2025, 11, 1)),
            ("old2", d(2025, 10, 29)),
            ("old3", d(2025, 10, 28)),
        ]);
        let mut feed = ScriptedFeed::new(vec![all]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 3), &cfg);

        assert_eq!(ctl.run().await.unwrap(), StopReason::ExhaustedFeed);
        assert_eq!(ctl.state().consecutive_before_start, 2);
        assert_eq!(ctl.summary().extracted, 1);
    }

    #[tokio::test]
    async fn retries_unavailable_detail_then_persists_once() {
        let all = tiles(&[("flaky", d(2025, 11, 10))]);
        let timeout = || Err(CapabilityError::Timeout("classDetailsTitle".into()));
        let mut feed = ScriptedFeed::new(vec![all])
            .script("flaky", vec![timeout(), timeout(), Ok(good_fields("flaky"))]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        assert_eq!(ctl.run().await.unwrap(), StopReason::ExhaustedFeed);
        assert_eq!(ctl.summary().extracted, 1);
        assert_eq!(ctl.summary().inserted, 1);
        assert_eq!(ctl.summary().updated, 0);
        assert_eq!(ctl.summary().total_skipped(), 0);
        assert_eq!(feed.opens_of("flaky"), 3);
        assert_eq!(feed.open_surfaces, 0);
        assert_eq!(stored_ids(&store), vec!["flaky".to_string()]);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let all = tiles(&[("gone", d(2025, 11, 10)), ("fine", d(2025, 11, 9))]);
        let timeout = || Err(CapabilityError::Timeout("classDetailsTitle".into()));
        let mut feed = ScriptedFeed::new(vec![all])
            .script("gone", vec![timeout(), timeout(), timeout(), timeout()]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        assert_eq!(ctl.run().await.unwrap(), StopReason::ExhaustedFeed);
        assert_eq!(ctl.summary().skipped.get(&SkipReason::DetailUnavailable), Some(&1));
        assert_eq!(ctl.summary().failures[0].identifier, "gone");
        assert_eq!(ctl.summary().extracted, 1);
        assert_eq!(feed.opens_of("gone"), 3);
        assert_eq!(stored_ids(&store), vec!["fine".to_string()]);
    }

    #[tokio::test]
    async fn field_missing_is_skipped_without_retry() {
        let all = tiles(&[("norating", d(2025, 11, 10)), ("ok", d(2025, 11, 9))]);
        let mut broken = good_fields("norating");
        broken.remove(FIELD_SPANS);
        let mut feed = ScriptedFeed::new(vec![all]).script("norating", vec![Ok(broken)]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        ctl.run().await.unwrap();
        assert_eq!(ctl.summary().skipped.get(&SkipReason::FieldMissing), Some(&1));
        assert_eq!(
            ctl.summary().failures,
            vec![ItemFailure {
                identifier: "norating".into(),
                reason: SkipReason::FieldMissing,
                message: "details for norating missing difficulty_rating".into(),
            }]
        );
        assert_eq!(feed.opens_of("norating"), 1);
        assert_eq!(stored_ids(&store), vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn limit_reached_mid_pass() {
        let all = tiles(&[
            ("a", d(2025, 11, 25)),
            ("b", d(2025, 11, 24)),
            ("c", d(2025, 11, 23)),
            ("d", d(2025, 11, 22)),
            ("e", d(2025, 11, 21)),
        ]);
        let mut feed = ScriptedFeed::new(vec![all]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(3, 10), &cfg);

        assert_eq!(ctl.run().await.unwrap(), StopReason::LimitReached);
        assert_eq!(ctl.state().items_extracted, 3);
        assert_eq!(feed.opened.len(), 3);
        assert_eq!(feed.scrolls, 0);
        assert_eq!(stored_ids(&store), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn persistence_failure_aborts_and_keeps_earlier_records() {
        let all = tiles(&[
            ("a", d(2025, 11, 25)),
            ("b", d(2025, 11, 24)),
            ("c", d(2025, 11, 23)),
            ("d", d(2025, 11, 22)),
        ]);
        let mut feed = ScriptedFeed::new(vec![all]);
        let mut store = FlakyStore { inner: SqliteStore::in_memory(), fail_on: 3, calls: 0 };
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        let err = ctl.run().await.unwrap_err();
        assert!(matches!(err, CrawlError::Persistence { ref identifier, .. } if identifier == "c"));
        assert_eq!(ctl.summary().extracted, 2);
        assert_eq!(ctl.summary().stop_reason, None);
        assert_eq!(ctl.state().phase, Phase::Stopped);
        assert!(!feed.opened.contains(&"d".to_string()));

        let kept = fetch_classes(
            store.inner.conn(),
            &ListFilter { start: None, end: None, instructor: None, limit: 10 },
        )
        .unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r.instructor == "Matt Wilpers" && r.duration_minutes == 45));
    }

    #[tokio::test]
    async fn rerunning_same_window_is_idempotent() {
        let all = five_then_twelve_old();
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();

        let mut first = ScriptedFeed::new(paged(all.clone(), 4));
        let mut ctl = Controller::new(&mut first, &mut store, november(100, 10), &cfg);
        ctl.run().await.unwrap();
        assert_eq!(ctl.summary().inserted, 5);
        let before = stored_ids(&store);

        let mut second = ScriptedFeed::new(paged(all, 4));
        let mut ctl = Controller::new(&mut second, &mut store, november(100, 10), &cfg);
        assert_eq!(ctl.run().await.unwrap(), StopReason::PastWindow);
        assert_eq!(ctl.summary().inserted, 0);
        assert_eq!(ctl.summary().updated, 5);
        assert_eq!(stored_ids(&store), before);
    }

    #[tokio::test]
    async fn skip_existing_does_not_reopen_stored_items() {
        let all = tiles(&[("a", d(2025, 11, 25)), ("b", d(2025, 11, 24))]);
        let mut store = SqliteStore::in_memory();
        let cfg = CrawlConfig { skip_existing: true, ..cfg() };

        let mut first = ScriptedFeed::new(vec![all[..1].to_vec()]);
        Controller::new(&mut first, &mut store, november(100, 10), &cfg)
            .run()
            .await
            .unwrap();

        let mut second = ScriptedFeed::new(vec![all]);
        let mut ctl = Controller::new(&mut second, &mut store, november(100, 10), &cfg);
        ctl.run().await.unwrap();
        assert_eq!(ctl.summary().already_stored, 1);
        assert_eq!(ctl.summary().extracted, 1);
        assert_eq!(second.opened, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn repeated_tiles_are_extracted_once() {
        let mut all = tiles(&[("a", d(2025, 11, 25)), ("b", d(2025, 11, 24))]);
        all.push(tile(2, "a", d(2025, 11, 25)));
        let mut feed = ScriptedFeed::new(paged(all, 1));
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        assert_eq!(ctl.run().await.unwrap(), StopReason::ExhaustedFeed);
        assert_eq!(ctl.summary().extracted, 2);
        assert_eq!(ctl.summary().passes, 4);
        assert_eq!(feed.opens_of("a"), 1);
    }

    #[tokio::test]
    async fn exhausted_feed_after_bounded_scrolls() {
        let all = tiles(&[("a", d(2025, 11, 25))]);
        let mut feed = ScriptedFeed::new(vec![all]);
        let mut store = SqliteStore::in_memory();
        let cfg = CrawlConfig { scroll_retries: 4, ..cfg() };
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        assert_eq!(ctl.run().await.unwrap(), StopReason::ExhaustedFeed);
        assert_eq!(ctl.summary().passes, 2);
        assert_eq!(feed.scrolls, 4);
    }

    #[tokio::test]
    async fn incomplete_tile_is_revisited() {
        let mut loading = tile(0, "late", d(2025, 11, 12));
        loading.text.clear();
        let rendered = tile(0, "late", d(2025, 11, 12));
        let mut feed = ScriptedFeed::new(vec![vec![loading], vec![rendered]]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        ctl.run().await.unwrap();
        assert_eq!(ctl.summary().extracted, 1);
        assert_eq!(ctl.summary().total_skipped(), 0);
    }

    #[tokio::test]
    async fn malformed_tile_reported_once() {
        let mut bad = tile(0, "nodate", d(2025, 11, 12));
        bad.text = "45 min Power Zone Ride\nENCORE".into();
        let good = tile(1, "ok", d(2025, 11, 11));
        let mut feed = ScriptedFeed::new(vec![vec![bad.clone()], vec![bad, good]]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        ctl.run().await.unwrap();
        assert_eq!(ctl.summary().skipped.get(&SkipReason::MalformedTile), Some(&1));
        assert_eq!(ctl.summary().failures[0].identifier, "nodate");
        assert_eq!(ctl.summary().extracted, 1);
    }

    #[tokio::test]
    async fn titleless_tiles_are_reported_not_ignored() {
        let mut all = tiles(&[
            ("a", d(2025, 11, 25)),
            ("b", d(2025, 11, 24)),
            ("c", d(2025, 11, 23)),
        ]);
        for t in &mut all {
            t.title = None;
        }
        let mut feed = ScriptedFeed::new(vec![all.clone(), all]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        assert_eq!(ctl.run().await.unwrap(), StopReason::ExhaustedFeed);
        assert_eq!(ctl.summary().extracted, 0);
        assert_eq!(ctl.summary().skipped.get(&SkipReason::MalformedTile), Some(&3));
        let ids: Vec<&str> = ctl.summary().failures.iter().map(|f| f.identifier.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(ctl.summary().failures.iter().all(|f| f.message.contains("no title on tile")));
        assert!(feed.opened.is_empty());
    }

    #[tokio::test]
    async fn scroll_interface_error_aborts() {
        let all = tiles(&[("a", d(2025, 11, 25))]);
        let mut feed = ScriptedFeed::new(vec![all.clone(), all]);
        feed.scroll_error = Some(CapabilityError::Interface("session deleted".into()));
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        assert!(matches!(ctl.run().await, Err(CrawlError::Feed(_))));
        assert_eq!(ctl.summary().extracted, 1);
        assert_eq!(stored_ids(&store), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn scroll_timeout_counts_as_empty_attempt() {
        let all = tiles(&[("a", d(2025, 11, 25)), ("b", d(2025, 11, 24))]);
        let mut feed = ScriptedFeed::new(paged(all, 1));
        feed.scroll_error = Some(CapabilityError::Timeout("scroll".into()));
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg);

        assert_eq!(ctl.run().await.unwrap(), StopReason::ExhaustedFeed);
        assert_eq!(ctl.summary().extracted, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_pass() {
        let all = tiles(&[("a", d(2025, 11, 25))]);
        let mut feed = ScriptedFeed::new(vec![all]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let flag = Arc::new(AtomicBool::new(true));
        let mut ctl = Controller::new(&mut feed, &mut store, november(100, 10), &cfg).with_cancel(flag);

        assert_eq!(ctl.run().await.unwrap(), StopReason::Cancelled);
        assert_eq!(ctl.summary().passes, 0);
        assert!(feed.opened.is_empty());
    }

    #[tokio::test]
    async fn zero_limit_extracts_nothing() {
        let all = tiles(&[("a", d(2025, 11, 25))]);
        let mut feed = ScriptedFeed::new(vec![all]);
        let mut store = SqliteStore::in_memory();
        let cfg = cfg();
        let mut ctl = Controller::new(&mut feed, &mut store, november(0, 10), &cfg);

        assert_eq!(ctl.run().await.unwrap(), StopReason::LimitReached);
        assert!(feed.opened.is_empty());
    }

    #[test]
    fn summary_serialises_skip_reasons() {
        let mut s = CrawlSummary::default();
        s.skipped.insert(SkipReason::FieldMissing, 2);
        s.stop_reason = Some(StopReason::PastWindow);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["skipped"]["FieldMissing"], 2);
        assert_eq!(json["stop_reason"], "PastWindow");
    }
}
