use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use ::scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thirtyfour::prelude::*;
use thirtyfour::{Cookie, WindowHandle};
use tokio::runtime::Runtime;

use crate::models::{RawPosting, SearchTemplate, UNAVAILABLE};
use crate::pipeline::CancelToken;

const SEARCH_BASE: &str = "https://www.linkedin.com/jobs/search/?";
const LOGIN_URL: &str = "https://www.linkedin.com/login";
const HOME_URL: &str = "https://www.linkedin.com";

const LIST_ITEM: &str = "li.scaffold-layout__list-item";
const LOGGED_IN_MARKER: &str = "a[href*='/me/']";
const DETAIL_TITLE: &str = "h1[class*='t-24']";
const DETAIL_COMPANY: &str = "div[class*='company-name'] a";
const DETAIL_LOCATION: &str = "span[dir='ltr'] > span[class*='tvm__text']";
const DETAIL_DESCRIPTION: &str = "div[class*='jobs-description-content__text']";

const LOGIN_TIMEOUT: Duration = Duration::from_secs(180);
const LIST_TIMEOUT: Duration = Duration::from_secs(100);
const DETAIL_TIMEOUT: Duration = Duration::from_secs(5);

// --- Filter vocabulary ---
//
// The site's query grammar uses fixed bucket codes; anything outside these
// tables is rejected before a run is created.

pub fn distance_bucket(km: u32) -> Option<u32> {
    match km {
        0 => Some(0),
        8 => Some(5),
        16 => Some(10),
        40 => Some(25),
        80 => Some(50),
        160 => Some(100),
        _ => None,
    }
}

pub fn recency_seconds(date_posted: &str) -> Option<u64> {
    match date_posted.to_lowercase().as_str() {
        "past month" => Some(2_592_000),
        "past week" => Some(604_800),
        "past 24 hours" => Some(86_400),
        _ => None,
    }
}

pub fn exp_level_code(level: &str) -> Option<u8> {
    match level.to_lowercase().as_str() {
        "internship" => Some(1),
        "entry level" => Some(2),
        "associate" => Some(3),
        "mid-senior level" => Some(4),
        "director" => Some(5),
        "executive" => Some(6),
        _ => None,
    }
}

pub fn job_type_code(job_type: &str) -> Option<char> {
    match job_type.to_lowercase().as_str() {
        "full-time" => Some('F'),
        "part-time" => Some('P'),
        "contract" => Some('C'),
        "temporary" => Some('T'),
        "other" => Some('O'),
        "internship" => Some('I'),
        _ => None,
    }
}

/// Reject invalid filter values before any browser session is opened.
pub fn validate(template: &SearchTemplate) -> Result<()> {
    let mut errors = Vec::new();

    if template.keywords.trim().is_empty() {
        errors.push("Keywords must not be empty.".to_string());
    }
    if template.locations().is_empty() {
        errors.push("At least one location is required.".to_string());
    }
    if template.pages == 0 {
        errors.push("Page count must be at least 1.".to_string());
    }
    if let Some(km) = template.distance_km {
        if distance_bucket(km).is_none() {
            errors.push(format!("Distance must be one of 0, 8, 16, 40, 80, 160 km (got {km})."));
        }
    }
    if let Some(date) = &template.date_posted {
        if recency_seconds(date).is_none() {
            errors.push(format!(
                "Date posted must be one of: past month, past week, past 24 hours (got '{date}')."
            ));
        }
    }
    for level in template.exp_levels() {
        if exp_level_code(&level).is_none() {
            errors.push(format!("Invalid experience level: '{level}'."));
        }
    }
    for job_type in template.job_types() {
        if job_type_code(&job_type).is_none() {
            errors.push(format!("Invalid job type: '{job_type}'."));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(errors.join("\n")))
    }
}

pub fn build_search_url(run: &SearchTemplate, location: &str) -> String {
    let mut params = vec![
        format!("keywords={}", run.keywords),
        format!("location={location}"),
    ];

    if let Some(miles) = run.distance_km.filter(|km| *km != 0).and_then(distance_bucket) {
        params.push(format!("distance={miles}"));
    }
    if let Some(seconds) = run.date_posted.as_deref().and_then(recency_seconds) {
        params.push(format!("f_TPR=r{seconds}"));
    }
    let exp_codes: Vec<String> = run
        .exp_levels()
        .iter()
        .filter_map(|level| exp_level_code(level))
        .map(|code| code.to_string())
        .collect();
    if !exp_codes.is_empty() {
        params.push(format!("f_E={}", exp_codes.join(",")));
    }
    let type_codes: Vec<String> = run
        .job_types()
        .iter()
        .filter_map(|job_type| job_type_code(job_type))
        .map(|code| code.to_string())
        .collect();
    if !type_codes.is_empty() {
        params.push(format!("f_JT={}", type_codes.join(",")));
    }

    format!("{SEARCH_BASE}{}", params.join("&"))
}

// --- Session cookies ---

#[derive(Debug, Serialize, Deserialize)]
struct StoredCookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    secure: bool,
}

impl StoredCookie {
    fn from_cookie(cookie: &Cookie) -> Self {
        Self {
            name: cookie.name.to_string(),
            value: cookie.value.to_string(),
            domain: cookie.domain.clone(),
            path: cookie.path.clone(),
            secure: cookie.secure.unwrap_or(false),
        }
    }

    fn into_cookie(self) -> Cookie {
        let mut cookie = Cookie::new(self.name, self.value);
        if let Some(domain) = self.domain {
            cookie.set_domain(domain);
        }
        if let Some(path) = self.path {
            cookie.set_path(path);
        }
        cookie.set_secure(self.secure);
        cookie
    }
}

// --- The adapter ---

/// Session-authenticated collector for job postings. Owns a WebDriver
/// session driven from a dedicated single-thread runtime, so the rest of
/// the pipeline stays on plain blocking threads.
///
/// A collector is good for one run: sessions are not restartable.
pub struct JobScraper {
    runtime: Runtime,
    driver: WebDriver,
    cookie_path: PathBuf,
}

impl JobScraper {
    pub fn connect(webdriver_url: &str, cookie_path: &Path) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build the browser session runtime")?;

        let driver = runtime
            .block_on(async {
                let mut caps = DesiredCapabilities::chrome();
                caps.add_arg("--disable-blink-features=AutomationControlled")?;
                caps.add_arg(
                    "user-agent=Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
                )?;
                WebDriver::new(webdriver_url, caps).await
            })
            .with_context(|| format!("Failed to start a browser session at {webdriver_url}"))?;

        Ok(Self {
            runtime,
            driver,
            cookie_path: cookie_path.to_path_buf(),
        })
    }

    /// Restore the persisted session, falling back to an interactive
    /// login. Failure here is fatal for the run.
    pub fn establish_session(&self) -> Result<()> {
        self.runtime
            .block_on(establish_session(&self.driver, &self.cookie_path))
    }

    /// Walk all locations and pages of the run, handing each posting to
    /// `emit`. `emit` returning false stops collection (the consumer side
    /// is gone). Returns the number of postings emitted.
    pub fn collect(
        &self,
        run: &SearchTemplate,
        token: &CancelToken,
        emit: &mut dyn FnMut(RawPosting) -> bool,
    ) -> Result<usize> {
        self.runtime.block_on(collect(&self.driver, run, token, emit))
    }

    pub fn quit(self) -> Result<()> {
        let Self { runtime, driver, .. } = self;
        runtime
            .block_on(driver.quit())
            .context("Failed to close the browser session")
    }
}

async fn establish_session(driver: &WebDriver, cookie_path: &Path) -> Result<()> {
    if cookie_path.exists() {
        match replay_cookies(driver, cookie_path).await {
            Ok(()) => {
                if session_is_live(driver).await {
                    info!("Session restored from saved cookies");
                    return Ok(());
                }
                warn!("Saved session is no longer valid, starting interactive login");
            }
            Err(e) => warn!("Could not replay saved cookies: {e:#}"),
        }
    } else {
        info!("No saved session found, starting interactive login");
    }
    manual_login(driver, cookie_path).await
}

async fn replay_cookies(driver: &WebDriver, cookie_path: &Path) -> Result<()> {
    let data = std::fs::read_to_string(cookie_path)
        .with_context(|| format!("Failed to read {}", cookie_path.display()))?;
    let cookies: Vec<StoredCookie> =
        serde_json::from_str(&data).context("Session cookie file is malformed")?;

    driver.goto(HOME_URL).await?;
    for stored in cookies {
        let name = stored.name.clone();
        if let Err(e) = driver.add_cookie(stored.into_cookie()).await {
            debug!("Skipped cookie {name}: {e}");
        }
    }
    Ok(())
}

async fn session_is_live(driver: &WebDriver) -> bool {
    if driver.goto(HOME_URL).await.is_err() {
        return false;
    }
    driver
        .query(By::Css(LOGGED_IN_MARKER))
        .wait(Duration::from_secs(10), Duration::from_secs(1))
        .exists()
        .await
        .unwrap_or(false)
}

async fn manual_login(driver: &WebDriver, cookie_path: &Path) -> Result<()> {
    driver.goto(LOGIN_URL).await?;
    info!(
        "Please log in manually in the browser window ({}s timeout)",
        LOGIN_TIMEOUT.as_secs()
    );

    let logged_in = driver
        .query(By::Css(LOGGED_IN_MARKER))
        .wait(LOGIN_TIMEOUT, Duration::from_secs(2))
        .exists()
        .await?;
    if !logged_in {
        return Err(anyhow!("Login timeout exceeded ({}s)", LOGIN_TIMEOUT.as_secs()));
    }

    info!("Login successful");
    save_cookies(driver, cookie_path).await
}

async fn save_cookies(driver: &WebDriver, cookie_path: &Path) -> Result<()> {
    let cookies = driver.get_all_cookies().await?;
    let stored: Vec<StoredCookie> = cookies.iter().map(StoredCookie::from_cookie).collect();

    if let Some(parent) = cookie_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(cookie_path, serde_json::to_string_pretty(&stored)?)
        .with_context(|| format!("Failed to write {}", cookie_path.display()))?;
    info!("Session cookies saved to {}", cookie_path.display());
    Ok(())
}

async fn collect(
    driver: &WebDriver,
    run: &SearchTemplate,
    token: &CancelToken,
    emit: &mut dyn FnMut(RawPosting) -> bool,
) -> Result<usize> {
    let locations = run.locations();
    // Repeat listings within one run are keyed by (company, title); link
    // level dedup belongs to the store.
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut total = 0usize;

    for (idx, location) in locations.iter().enumerate() {
        if token.is_cancelled() {
            info!("Stop requested, ending collection");
            break;
        }
        info!("Collecting location {}/{}: {location}", idx + 1, locations.len());

        match collect_location(driver, run, location, token, &mut seen, &mut total, emit).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => warn!("[{location}] Collection failed: {e:#}"),
        }
    }

    info!("Collection finished, {total} posting(s) emitted");
    Ok(total)
}

#[allow(clippy::too_many_arguments)]
async fn collect_location(
    driver: &WebDriver,
    run: &SearchTemplate,
    location: &str,
    token: &CancelToken,
    seen: &mut HashSet<(String, String)>,
    total: &mut usize,
    emit: &mut dyn FnMut(RawPosting) -> bool,
) -> Result<bool> {
    driver.goto(build_search_url(run, location)).await?;

    let mut page = 1;
    loop {
        match collect_page(driver, location, page, token, seen, total, emit).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                warn!("[{location}] Error on page {page}: {e:#}");
                return Ok(true);
            }
        }

        if page >= run.pages {
            break;
        }
        if token.is_cancelled() {
            return Ok(false);
        }
        match next_page(driver).await {
            Ok(true) => page += 1,
            Ok(false) => {
                info!("[{location}] No more pages available");
                break;
            }
            Err(e) => {
                warn!("[{location}] Could not advance past page {page}: {e:#}");
                break;
            }
        }
    }
    Ok(true)
}

async fn next_page(driver: &WebDriver) -> Result<bool> {
    let Ok(button) = driver.find(By::XPath("//button[span[text()='Next']]")).await else {
        return Ok(false);
    };
    if !button.is_enabled().await? {
        return Ok(false);
    }
    button.click().await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
async fn collect_page(
    driver: &WebDriver,
    location: &str,
    page: u32,
    token: &CancelToken,
    seen: &mut HashSet<(String, String)>,
    total: &mut usize,
    emit: &mut dyn FnMut(RawPosting) -> bool,
) -> Result<bool> {
    driver
        .query(By::Css(LIST_ITEM))
        .wait(LIST_TIMEOUT, Duration::from_millis(500))
        .first()
        .await
        .context("Results list did not materialize")?;

    // Force lazily-loaded entries to render before counting them.
    driver
        .execute("window.scrollTo(0, document.body.scrollHeight);", Vec::new())
        .await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let items = driver.find_all(By::Css(LIST_ITEM)).await?;
    info!("[{location}] Page {page}: found {} job listings", items.len());

    for (idx, item) in items.iter().enumerate() {
        if token.is_cancelled() {
            info!("Stop requested, halting collection");
            return Ok(false);
        }

        match collect_item(driver, item).await {
            Ok(Some(posting)) => {
                let key = (posting.company.clone(), posting.title.clone());
                if seen.insert(key) {
                    *total += 1;
                    info!(
                        "[{location}] Job {}/{}: {} @ {} | Total: {total}",
                        idx + 1,
                        items.len(),
                        posting.title,
                        posting.company
                    );
                    if !emit(posting) {
                        return Ok(false);
                    }
                } else {
                    debug!(
                        "[{location}] Repeat listing skipped: {} @ {}",
                        posting.title, posting.company
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("[{location}] Failed to collect job {}/{}: {e:#}", idx + 1, items.len());
            }
        }

        if token.is_cancelled() {
            info!("Stop requested, halting collection");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Extract one posting from the list. Returns None for items that are
/// skipped on purpose (detail pane desync, unresolvable link).
async fn collect_item(driver: &WebDriver, item: &WebElement) -> Result<Option<RawPosting>> {
    dismiss_trust_dialog(driver).await;

    item.click().await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Transient UI desync is expected; skip the item rather than failing.
    let detail_ready = driver
        .query(By::Css(DETAIL_TITLE))
        .wait(DETAIL_TIMEOUT, Duration::from_millis(500))
        .exists()
        .await?;
    if !detail_ready {
        warn!("Detail view did not update after selection, skipping item");
        return Ok(None);
    }

    let source = driver.source().await?;
    let fields = extract_fields(&source);

    let Some(link) = resolve_application_link(driver).await else {
        debug!("No application link resolved for '{}', discarding", fields.title);
        return Ok(None);
    };

    Ok(Some(RawPosting {
        title: fields.title,
        company: fields.company,
        location: fields.location,
        description: fields.description,
        application_link: link,
    }))
}

async fn dismiss_trust_dialog(driver: &WebDriver) {
    if driver
        .find(By::XPath("//div[contains(@class,'job-trust-pre-apply')]"))
        .await
        .is_ok()
    {
        if let Ok(close) = driver.find(By::XPath("//button[1]")).await {
            let _ = close.click().await;
        }
    }
}

/// The canonical application URL. Easy Apply postings resolve to the
/// posting itself; external postings open a second window whose URL is
/// captured and closed again. None means the item cannot be deduplicated
/// or persisted safely and must be discarded.
async fn resolve_application_link(driver: &WebDriver) -> Option<String> {
    if driver
        .find(By::XPath("//button[contains(@aria-label,'Easy Apply to')]"))
        .await
        .is_ok()
    {
        return driver.current_url().await.ok().map(|url| url.to_string());
    }

    let apply = driver
        .find(By::XPath("//button[contains(@id,'jobs-apply-button-id')]"))
        .await
        .ok()?;
    apply.click().await.ok()?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let original: WindowHandle = driver.window().await.ok()?;
    let handles = driver.windows().await.ok()?;
    let external = handles.into_iter().find(|handle| *handle != original)?;

    driver.switch_to_window(external).await.ok()?;
    let link = driver.current_url().await.ok().map(|url| url.to_string());
    let _ = driver.close_window().await;
    let _ = driver.switch_to_window(original).await;
    link
}

// --- Field extraction ---

struct DetailFields {
    title: String,
    company: String,
    location: String,
    description: String,
}

/// Pull the detail-pane fields out of the page source. Every field is
/// independently fault-tolerant: a missing element becomes the
/// "Not Available" sentinel instead of failing the item.
fn extract_fields(page_source: &str) -> DetailFields {
    let document = Html::parse_document(page_source);
    DetailFields {
        title: select_text(&document, DETAIL_TITLE).unwrap_or_else(|| UNAVAILABLE.to_string()),
        company: select_text(&document, DETAIL_COMPANY).unwrap_or_else(|| UNAVAILABLE.to_string()),
        location: select_text(&document, DETAIL_LOCATION)
            .unwrap_or_else(|| UNAVAILABLE.to_string()),
        description: select_block(&document, DETAIL_DESCRIPTION)
            .unwrap_or_else(|| UNAVAILABLE.to_string()),
    }
}

fn select_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let element = document.select(&selector).next()?;
    let text = element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    (!text.is_empty()).then_some(text)
}

/// Like `select_text` but keeps line structure, for multi-paragraph
/// description bodies.
fn select_block(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let element = document.select(&selector).next()?;
    let text = element
        .text()
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    (!text.is_empty()).then_some(text)
}
