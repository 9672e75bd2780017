use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fantoccini::error::{CmdError, ErrorStatus};
use fantoccini::wd::WindowHandle;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::capability::{BrowseCapability, CapResult, CapabilityError, DetailHandle, RawFields, RawTile};
use crate::config::{CrawlConfig, LOGIN_URL};
use crate::detail::{FIELD_DURATION, FIELD_SPANS, FIELD_SUBTITLE, FIELD_TITLE, FIELD_URL};

const TILE: &str = "[data-test-id='videoCell']";
const TILE_TITLE: &str = "[data-test-id='videoCellTitle']";
const DETAILS_TITLE: &str = "[data-test-id='classDetailsTitle']";
const DETAILS_SUBTITLE: &str = "[data-test-id='classDetailsSubtitle']";
const FILTER_BUTTON: &str = "[data-test-id='filterButton']";
const FILTER_CLOSE: &str = "[data-test-id='filterCloseButton']";
const CLASS_TYPE_ACCORDION: &str = "button[id='accordion-button-ClassType']";

const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
const UI_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(250);
// WebDriver's code point for the Return key
const ENTER: &str = "\u{E007}";

const READ_TILES_JS: &str = r#"
return Array.from(document.querySelectorAll(arguments[0])).map((el, i) => {
    const link = el.matches('a[href]') ? el : el.querySelector('a[href]');
    const title = el.querySelector(arguments[1]);
    return {
        index: i,
        href: link ? link.getAttribute('href') : null,
        title: title ? title.innerText : null,
        text: el.innerText || ''
    };
});
"#;

const READ_DETAILS_JS: &str = r#"
const text = (sel) => { const el = document.querySelector(sel); return el ? el.innerText : ''; };
const spans = Array.from(document.querySelectorAll('span')).map(s => (s.innerText || '').trim());
return {
    title: text(arguments[0]),
    subtitle: text(arguments[1]),
    duration: spans.find(s => /\d+\s*min/.test(s)) || '',
    spans: spans.filter(s => s.length > 0).join('\n'),
    url: window.location.href
};
"#;

const COUNT_TILES_JS: &str = "return document.querySelectorAll(arguments[0]).length;";
const SCROLL_JS: &str = "window.scrollTo(0, document.body.scrollHeight);";

/// Page-load and script timeouts reported by the driver itself.
fn is_timeout_status(status: &ErrorStatus) -> bool {
    matches!(status, ErrorStatus::Timeout | ErrorStatus::ScriptTimeout)
}

fn cap_err(what: &str, e: CmdError) -> CapabilityError {
    match e {
        CmdError::WaitTimeout => CapabilityError::Timeout(what.to_string()),
        CmdError::Standard(ref wd) if is_timeout_status(&wd.error) => {
            CapabilityError::Timeout(what.to_string())
        }
        other => CapabilityError::Interface(format!("{what}: {other}")),
    }
}

/// One logged-in WebDriver session over the class catalog.
pub struct WebDriverSession {
    client: Client,
    cfg: CrawlConfig,
    feed_window: Option<WindowHandle>,
    /// Set while focus is on a details tab; cleared once back on the feed.
    in_detail: bool,
    tile_count: usize,
}

impl WebDriverSession {
    pub async fn connect(cfg: &CrawlConfig) -> Result<Self> {
        let mut args = vec!["--window-size=1920,1080"];
        if cfg.headless {
            args.extend(["--headless=new", "--disable-gpu", "--no-sandbox", "--disable-dev-shm-usage"]);
        }
        let mut caps = serde_json::Map::new();
        caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));

        info!("Connecting to WebDriver at {}", cfg.webdriver_url);
        let client = ClientBuilder::native()
            .capabilities(caps)
            .connect(&cfg.webdriver_url)
            .await
            .with_context(|| format!("Failed to start a WebDriver session at {}", cfg.webdriver_url))?;

        Ok(Self {
            client,
            cfg: cfg.clone(),
            feed_window: None,
            in_detail: false,
            tile_count: 0,
        })
    }

    pub async fn login(&mut self, email: &str, password: &str) -> Result<()> {
        self.client.goto(LOGIN_URL).await?;
        let user = self
            .client
            .wait()
            .at_most(LOGIN_TIMEOUT)
            .for_element(Locator::Id("usernameOrEmail"))
            .await
            .context("Login form did not load")?;
        user.send_keys(email).await?;
        let pass = self.client.find(Locator::Id("password")).await?;
        pass.send_keys(password).await?;
        pass.send_keys(ENTER).await?;

        let deadline = Instant::now() + LOGIN_TIMEOUT;
        loop {
            let url = self.client.current_url().await?;
            if ["/home", "/overview", "/classes"].iter().any(|p| url.path().contains(p)) {
                info!("Logged in");
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("Login did not complete within {}s (still at {})", LOGIN_TIMEOUT.as_secs(), url);
            }
            tokio::time::sleep(POLL).await;
        }
    }

    pub async fn close(self) -> Result<()> {
        self.client.close().await?;
        Ok(())
    }

    async fn click(&self, locator: Locator<'_>, what: &str) -> CapResult<()> {
        let el = self
            .client
            .wait()
            .at_most(UI_TIMEOUT)
            .for_element(locator)
            .await
            .map_err(|e| cap_err(what, e))?;
        el.click().await.map_err(|e| cap_err(what, e))?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    async fn apply_class_type_filter(&self) -> CapResult<()> {
        let class_type = self.cfg.class_type.as_str();
        info!("Applying '{}' class type filter", class_type);
        self.click(Locator::Css(FILTER_BUTTON), "filter button").await?;
        self.click(Locator::Css(CLASS_TYPE_ACCORDION), "class type accordion").await?;
        let option = format!("//button[.//span[contains(text(), '{class_type}')]]");
        self.click(Locator::XPath(&option), "class type option").await?;
        self.click(Locator::Css(FILTER_CLOSE), "filter close button").await?;
        Ok(())
    }

    async fn count_tiles(&self) -> CapResult<usize> {
        let v = self
            .client
            .execute(COUNT_TILES_JS, vec![json!(TILE)])
            .await
            .map_err(|e| cap_err("tile count", e))?;
        Ok(v.as_u64().unwrap_or(0) as usize)
    }

    async fn wait_for_tiles(&self) -> CapResult<()> {
        self.client
            .wait()
            .at_most(UI_TIMEOUT)
            .for_element(Locator::Css(TILE))
            .await
            .map(|_| ())
            .map_err(|e| cap_err("catalog tiles", e))
    }

    async fn back_to_feed(&mut self) -> CapResult<()> {
        if let Some(feed) = &self.feed_window {
            self.client
                .switch_to_window(feed.clone())
                .await
                .map_err(|e| cap_err("feed window", e))?;
        }
        self.in_detail = false;
        Ok(())
    }

    /// A details open abandoned mid-flight leaves focus on its tab.
    async fn ensure_on_feed(&mut self) -> CapResult<()> {
        if !self.in_detail {
            return Ok(());
        }
        warn!("Focus left on a details tab, closing it");
        if let Err(e) = self.client.close_window().await {
            warn!("Closing stray details tab failed: {}", e);
        }
        self.back_to_feed().await
    }
}

#[async_trait]
impl BrowseCapability for WebDriverSession {
    async fn navigate_to(&mut self, url: &str) -> CapResult<()> {
        self.client.goto(url).await.map_err(|e| cap_err(url, e))?;
        self.wait_for_tiles().await?;
        if !self.cfg.class_type.is_empty() {
            self.apply_class_type_filter().await?;
            self.wait_for_tiles().await?;
        }
        self.feed_window = Some(self.client.window().await.map_err(|e| cap_err("window", e))?);
        self.tile_count = self.count_tiles().await?;
        debug!("Catalog open with {} tiles", self.tile_count);
        Ok(())
    }

    async fn scroll_to_load_more(&mut self) -> CapResult<bool> {
        self.ensure_on_feed().await?;
        let before = self.count_tiles().await?;
        self.client
            .execute(SCROLL_JS, vec![])
            .await
            .map_err(|e| cap_err("scroll", e))?;

        let deadline = Instant::now() + self.cfg.scroll_wait;
        loop {
            tokio::time::sleep(POLL).await;
            let now = self.count_tiles().await?;
            if now > before {
                debug!("Scroll loaded {} new tiles ({} total)", now - before, now);
                self.tile_count = now;
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    async fn read_visible_tiles(&mut self) -> CapResult<Vec<RawTile>> {
        self.ensure_on_feed().await?;
        let value = self
            .client
            .execute(READ_TILES_JS, vec![json!(TILE), json!(TILE_TITLE)])
            .await
            .map_err(|e| cap_err("tiles", e))?;
        serde_json::from_value(value)
            .map_err(|e| CapabilityError::Interface(format!("unreadable tile snapshot: {e}")))
    }

    async fn open_detail(&mut self, identifier: &str) -> CapResult<DetailHandle> {
        self.ensure_on_feed().await?;
        let url = self.cfg.details_url(identifier);
        let opened = self
            .client
            .new_window(true)
            .await
            .map_err(|e| cap_err("details tab", e))?;
        if let Err(e) = self.client.switch_to_window(opened.handle).await {
            warn!("Could not switch to the details tab for {}, it stays open", identifier);
            return Err(cap_err("details tab", e));
        }
        self.in_detail = true;

        if let Err(e) = self.client.goto(&url).await {
            if let Err(close) = self.client.close_window().await {
                warn!("Closing details tab for {} failed: {}", identifier, close);
            }
            self.back_to_feed().await?;
            return Err(cap_err("details page", e));
        }
        Ok(DetailHandle {
            identifier: identifier.to_string(),
        })
    }

    async fn read_detail_fields(&mut self, handle: &DetailHandle) -> CapResult<RawFields> {
        self.client
            .wait()
            .at_most(self.cfg.detail_timeout)
            .for_element(Locator::Css(DETAILS_TITLE))
            .await
            .map_err(|e| cap_err("classDetailsTitle", e))?;

        let value = self
            .client
            .execute(READ_DETAILS_JS, vec![json!(DETAILS_TITLE), json!(DETAILS_SUBTITLE)])
            .await
            .map_err(|e| cap_err("details fields", e))?;

        let Value::Object(map) = value else {
            return Err(CapabilityError::Interface(format!(
                "details for {} returned no fields",
                handle.identifier
            )));
        };
        let mut fields = RawFields::new();
        for key in [FIELD_TITLE, FIELD_SUBTITLE, FIELD_DURATION, FIELD_SPANS, FIELD_URL] {
            if let Some(s) = map.get(key).and_then(Value::as_str) {
                fields.insert(key.to_string(), s.to_string());
            }
        }
        Ok(fields)
    }

    async fn close_detail(&mut self, handle: DetailHandle) -> CapResult<()> {
        if let Err(e) = self.client.close_window().await {
            warn!("Closing details tab for {} failed: {}", handle.identifier, e);
        }
        self.back_to_feed().await
    }
}
