//! The research service: the tool surface built on top of the pool and the
//! navigator.
//!
//! Three operations: `search` (web search via DuckDuckGo's html endpoint),
//! `visit` (fetch a page as markdown) and `screenshot`. Each acquires one
//! page lease, navigates with the full protocol, extracts, and files the
//! result into the caller's research session.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use webscout_common::config::{EngineConfig, ScreenshotConfig};
use webscout_common::error::{EngineError, NavigationError};
use webscout_common::session::{ResearchSession, SessionStore};
use webscout_common::types::{
    EngineStats, NavigationOutcome, ResearchResult, ScreenshotResponse, SearchResponse,
    SearchResult, VisitResponse,
};
use webscout_common::utils;

use crate::browser_pool::{BrowserPool, PageLease};
use crate::circuit_breaker::CircuitBreaker;
use crate::instance::{is_dead_browser_error, is_dead_tab_error};
use crate::metrics::Metrics;
use crate::navigator::Navigator;

/// Hard ceiling for in-page extraction calls after a successful navigation.
const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(20);

const MAX_SEARCH_RESULTS: usize = 10;

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

/// RAII guard that decrements the active request counter on drop.
struct ActiveRequestGuard {
    counter: Arc<AtomicUsize>,
}

impl ActiveRequestGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

// ==================== Content Extraction ====================

/// Converts a fetched page into the text handed back to callers.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, html: &str) -> anyhow::Result<String>;
    fn name(&self) -> &str;
}

/// HTML-to-markdown extraction via htmd, with chrome (nav, footers,
/// scripts) stripped before conversion.
pub struct MarkdownExtractor;

impl ContentExtractor for MarkdownExtractor {
    fn extract(&self, html: &str) -> anyhow::Result<String> {
        let converter = htmd::HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe",
            ])
            .build();
        let markdown = converter
            .convert(html)
            .map_err(|e| anyhow::anyhow!("markdown conversion failed: {}", e))?;
        Ok(collapse_blank_lines(&markdown))
    }

    fn name(&self) -> &str {
        "markdown"
    }
}

/// Collapse runs of three or more blank lines down to one blank line.
fn collapse_blank_lines(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut blanks = 0;
    for line in markdown.lines() {
        if line.trim().is_empty() {
            blanks += 1;
            if blanks > 1 {
                continue;
            }
        } else {
            blanks = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

// ==================== Screenshot Persistence ====================

pub struct ScreenshotStore {
    config: ScreenshotConfig,
}

impl ScreenshotStore {
    pub fn new(config: ScreenshotConfig) -> Self {
        Self { config }
    }

    /// Write captured PNG bytes under the screenshot directory. The filename
    /// derives from the page title plus a random suffix to avoid collisions.
    pub async fn persist(&self, bytes: &[u8], title: &str) -> Result<String, EngineError> {
        if bytes.len() as u64 > self.config.max_bytes {
            return Err(EngineError::Screenshot(format!(
                "capture is {} bytes, over the {} byte limit",
                bytes.len(),
                self.config.max_bytes
            )));
        }

        tokio::fs::create_dir_all(&self.config.dir)
            .await
            .map_err(|e| EngineError::Screenshot(format!("creating screenshot dir: {}", e)))?;

        let filename = format!(
            "{}_{}.png",
            utils::sanitize_filename(title, 64),
            utils::ray_id()
        );
        let path = self.config.dir.join(filename);

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| EngineError::Screenshot(format!("writing {}: {}", path.display(), e)))?;

        Ok(path.to_string_lossy().to_string())
    }
}

// ==================== Research Service ====================

pub struct ResearchService {
    pool: Arc<BrowserPool>,
    breaker: Arc<CircuitBreaker>,
    navigator: Navigator,
    sessions: SessionStore,
    extractor: Box<dyn ContentExtractor>,
    screenshots: ScreenshotStore,
    metrics: Metrics,
    active_requests: Arc<AtomicUsize>,
    is_ready: Arc<AtomicBool>,
}

impl ResearchService {
    pub fn new(
        config: &EngineConfig,
        pool: Arc<BrowserPool>,
        breaker: Arc<CircuitBreaker>,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> Self {
        let sessions = SessionStore::new(&config.session);
        sessions.start_cleanup_task(shutdown.clone());

        Self {
            pool,
            breaker,
            navigator: Navigator::new(config.navigation.clone(), shutdown),
            sessions,
            extractor: Box::new(MarkdownExtractor),
            screenshots: ScreenshotStore::new(config.screenshot.clone()),
            metrics,
            active_requests: Arc::new(AtomicUsize::new(0)),
            is_ready: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn active_requests_handle(&self) -> Arc<AtomicUsize> {
        self.active_requests.clone()
    }

    pub fn is_ready_handle(&self) -> Arc<AtomicBool> {
        self.is_ready.clone()
    }

    /// Run a web search and return the top results. A new research session
    /// is opened unless the caller passes an existing one.
    pub async fn search(
        &self,
        query: &str,
        session_id: Option<&str>,
    ) -> Result<SearchResponse, EngineError> {
        let _guard = ActiveRequestGuard::new(self.active_requests.clone());
        self.metrics.tool_calls.with_label_values(&["search"]).inc();
        let ray_id = utils::ray_id();

        let session_id = self.resolve_session(session_id, query).await?;

        let search_url = Url::parse_with_params(SEARCH_ENDPOINT, &[("q", query)])
            .map_err(|e| EngineError::Navigation(NavigationError::InvalidUrl(e.to_string())))?;

        info!(ray_id = %ray_id, query = %query, "search");

        let lease = self.pool.acquire().await?;
        let outcome = self.navigate(&lease, search_url.as_str(), &ray_id).await?;

        let raw = self
            .eval_blocking(&lease, &ray_id, {
                let tab = lease.page().clone();
                move || extract_search_results(&tab).map_err(|e| e.to_string())
            })
            .await?;

        let results: Vec<SearchResult> = raw
            .into_iter()
            .take(MAX_SEARCH_RESULTS)
            .map(|r| SearchResult {
                title: r.title,
                url: clean_result_url(&r.url),
                snippet: r.snippet,
            })
            .collect();

        debug!(
            ray_id = %ray_id,
            results = results.len(),
            final_url = %outcome.final_url,
            "search extracted"
        );

        file_search_results(&self.sessions, &session_id, &results).await?;

        self.refresh_memory_usage(&lease).await;

        Ok(SearchResponse {
            session_id,
            query: query.to_string(),
            results,
        })
    }

    /// Fetch a page and return its content as markdown, filing the result
    /// into the session.
    pub async fn visit(
        &self,
        url: &str,
        session_id: Option<&str>,
    ) -> Result<VisitResponse, EngineError> {
        let _guard = ActiveRequestGuard::new(self.active_requests.clone());
        self.metrics.tool_calls.with_label_values(&["visit"]).inc();
        let ray_id = utils::ray_id();

        let session_id = self.resolve_session(session_id, url).await?;

        info!(ray_id = %ray_id, url = %url, "visit");

        let lease = self.pool.acquire().await?;
        let outcome = self.navigate(&lease, url, &ray_id).await?;

        let html = self
            .eval_blocking(&lease, &ray_id, {
                let tab = lease.page().clone();
                move || tab.get_content().map_err(|e| e.to_string())
            })
            .await?;

        let content = self
            .extractor
            .extract(&html)
            .map_err(|e| EngineError::Extraction(e.to_string()))?;

        self.sessions
            .add_result(
                &session_id,
                ResearchResult::new(
                    outcome.final_url.as_str(),
                    outcome.title.as_str(),
                    content.as_str(),
                ),
            )
            .await?;

        self.refresh_memory_usage(&lease).await;

        Ok(VisitResponse {
            session_id,
            url: url.to_string(),
            final_url: outcome.final_url,
            title: outcome.title,
            content,
        })
    }

    /// Capture a full-page screenshot and persist it to disk.
    pub async fn screenshot(
        &self,
        url: &str,
        session_id: Option<&str>,
    ) -> Result<ScreenshotResponse, EngineError> {
        let _guard = ActiveRequestGuard::new(self.active_requests.clone());
        self.metrics
            .tool_calls
            .with_label_values(&["screenshot"])
            .inc();
        let ray_id = utils::ray_id();

        let session_id = self.resolve_session(session_id, url).await?;

        info!(ray_id = %ray_id, url = %url, "screenshot");

        let lease = self.pool.acquire().await?;
        let outcome = self.navigate(&lease, url, &ray_id).await?;

        let bytes = self
            .eval_blocking(&lease, &ray_id, {
                let tab = lease.page().clone();
                move || {
                    tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                        .map_err(|e| e.to_string())
                }
            })
            .await?;

        let byte_len = bytes.len() as u64;
        let path = self.screenshots.persist(&bytes, &outcome.title).await?;

        self.sessions
            .add_result(
                &session_id,
                ResearchResult::new(
                    outcome.final_url.as_str(),
                    outcome.title.as_str(),
                    path.as_str(),
                ),
            )
            .await?;

        self.refresh_memory_usage(&lease).await;

        Ok(ScreenshotResponse {
            session_id,
            final_url: outcome.final_url,
            title: outcome.title,
            path,
            byte_len,
        })
    }

    pub async fn session(&self, session_id: &str) -> Result<ResearchSession, EngineError> {
        self.sessions
            .get_session(session_id)
            .await
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))
    }

    pub async fn end_session(&self, session_id: &str) {
        self.sessions.remove_session(session_id).await;
    }

    pub async fn engine_stats(&self) -> EngineStats {
        EngineStats {
            pool: self.pool.stats().await,
            breaker: self.breaker.snapshot(),
            sessions: self.sessions.stats().await,
            active_requests: self.active_requests.load(Ordering::SeqCst),
        }
    }

    async fn resolve_session(
        &self,
        session_id: Option<&str>,
        query: &str,
    ) -> Result<String, EngineError> {
        match session_id {
            Some(id) => {
                self.sessions
                    .get_session(id)
                    .await
                    .ok_or_else(|| EngineError::UnknownSession(id.to_string()))?;
                Ok(id.to_string())
            }
            None => Ok(self.sessions.create_session(query).await),
        }
    }

    /// Navigate through the lease, recording failures against the instance
    /// and the failure-reason counter on the way out.
    async fn navigate(
        &self,
        lease: &PageLease,
        url: &str,
        ray_id: &str,
    ) -> Result<NavigationOutcome, EngineError> {
        match self.navigator.safe_navigate(lease.page(), url, ray_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Validation errors never touched the browser; nothing to
                // hold against the instance.
                if !e.is_validation() {
                    lease.record_failure();
                    self.note_driver_state(lease, &e.to_string());
                }
                self.metrics
                    .navigation_failures
                    .with_label_values(&[failure_reason(&e)])
                    .inc();
                warn!(ray_id = %ray_id, url = %url, "navigation failed: {}", e);
                Err(EngineError::Navigation(e))
            }
        }
    }

    /// Page-closing and dead-driver signatures in an error message mean the
    /// instance's page cannot be reused as-is.
    fn note_driver_state(&self, lease: &PageLease, message: &str) {
        if message.contains("tab closed")
            || is_dead_tab_error(message)
            || is_dead_browser_error(message)
        {
            debug!(
                instance_id = %lease.instance_id(),
                "marking page closed after driver error"
            );
            lease.mark_page_closed();
        }
    }

    /// Run a blocking extraction call with a hard timeout. On timeout the
    /// tab is closed to abort the stuck call and the instance is flagged
    /// for recycling.
    async fn eval_blocking<T, F>(
        &self,
        lease: &PageLease,
        ray_id: &str,
        op: F,
    ) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, String> + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(op);

        match tokio::time::timeout(EXTRACTION_TIMEOUT, handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => {
                lease.record_failure();
                self.note_driver_state(lease, &message);
                Err(EngineError::Extraction(message))
            }
            Ok(Err(join_err)) => {
                lease.record_failure();
                Err(EngineError::Extraction(format!(
                    "driver task panicked: {}",
                    join_err
                )))
            }
            Err(_) => {
                warn!(
                    ray_id = %ray_id,
                    instance_id = %lease.instance_id(),
                    "extraction hard timeout, closing tab to abort"
                );
                let _ = lease.page().close(false);
                lease.record_failure();
                lease.mark_page_closed();
                Err(EngineError::Extraction(format!(
                    "hard timeout after {:?}; tab closed to abort",
                    EXTRACTION_TIMEOUT
                )))
            }
        }
    }

    /// Read the page's JS heap size into the instance metadata. Best-effort:
    /// `performance.memory` is Chrome-only and may be absent.
    async fn refresh_memory_usage(&self, lease: &PageLease) {
        let probed = self
            .eval_blocking(lease, "memory-probe", {
                let tab = lease.page().clone();
                move || {
                    let result = tab
                        .evaluate(
                            "performance.memory ? performance.memory.usedJSHeapSize : 0",
                            false,
                        )
                        .map_err(|e| e.to_string())?;
                    Ok(result.value.and_then(|v| v.as_u64()).unwrap_or(0))
                }
            })
            .await;

        if let Ok(bytes) = probed {
            lease.set_memory_usage(bytes);
        }
    }
}

/// File extracted search results into the caller's session, snippet as the
/// stored content.
async fn file_search_results(
    sessions: &SessionStore,
    session_id: &str,
    results: &[SearchResult],
) -> Result<(), EngineError> {
    for result in results {
        sessions
            .add_result(
                session_id,
                ResearchResult::new(
                    result.url.as_str(),
                    result.title.as_str(),
                    result.snippet.as_str(),
                ),
            )
            .await?;
    }
    Ok(())
}

/// Map a navigation error onto the stable failure-reason label set.
fn failure_reason(error: &NavigationError) -> &'static str {
    match error {
        NavigationError::InvalidUrl(_)
        | NavigationError::DisallowedProtocol { .. }
        | NavigationError::UrlTooLong { .. } => "validation",
        NavigationError::RedirectBlocked { .. } => "redirect_blocked",
        NavigationError::Cancelled => "cancelled",
        NavigationError::Exhausted { last_error, .. } => {
            if last_error.contains("bot protection") {
                "bot_protection"
            } else if last_error.contains("http status") {
                "http_error"
            } else if last_error.contains("timeout") {
                "timeout"
            } else {
                "exhausted"
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSearchResult {
    title: String,
    url: String,
    snippet: String,
}

/// Pull result tuples off a DuckDuckGo html-endpoint page.
fn extract_search_results(
    tab: &Arc<headless_chrome::browser::tab::Tab>,
) -> anyhow::Result<Vec<RawSearchResult>> {
    let js = r#"
        (() => {
            const items = [];
            for (const result of document.querySelectorAll('.result')) {
                const anchor = result.querySelector('a.result__a');
                if (!anchor) continue;
                const snippet = result.querySelector('.result__snippet');
                items.push({
                    title: (anchor.innerText || '').trim(),
                    url: anchor.href,
                    snippet: snippet ? (snippet.innerText || '').trim() : '',
                });
                if (items.length >= 10) break;
            }
            return JSON.stringify(items);
        })()
    "#;

    let result = tab.evaluate(js, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "[]".to_string());
    Ok(serde_json::from_str(&raw)?)
}

/// DuckDuckGo's html endpoint wraps result links in a redirect
/// (`/l/?uddg=<encoded>`); unwrap to the target URL when present.
fn clean_result_url(raw: &str) -> String {
    let candidate = if raw.starts_with("//") {
        format!("https:{}", raw)
    } else {
        raw.to_string()
    };

    let Ok(parsed) = Url::parse(&candidate) else {
        return raw.to_string();
    };

    let is_redirect = parsed
        .host_str()
        .map(|h| h.ends_with("duckduckgo.com"))
        .unwrap_or(false)
        && parsed.path().starts_with("/l/");

    if is_redirect {
        if let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg") {
            return target.to_string();
        }
    }

    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Extraction Tests ====================

    #[test]
    fn test_markdown_extractor_strips_chrome() {
        let html = r#"
            <html><head><script>evil()</script><style>.x{}</style></head>
            <body>
                <nav>Home | About</nav>
                <h1>Title</h1>
                <p>Body text with a <a href="https://example.com">link</a>.</p>
                <footer>Copyright</footer>
            </body></html>
        "#;
        let markdown = MarkdownExtractor.extract(html).unwrap();
        assert!(markdown.contains("# Title"));
        assert!(markdown.contains("Body text"));
        assert!(!markdown.contains("evil()"));
        assert!(!markdown.contains("Home | About"));
        assert!(!markdown.contains("Copyright"));
    }

    #[test]
    fn test_collapse_blank_lines() {
        let input = "a\n\n\n\n\nb\n\nc";
        assert_eq!(collapse_blank_lines(input), "a\n\nb\n\nc");
    }

    // ==================== Result URL Cleaning Tests ====================

    #[test]
    fn test_clean_result_url_unwraps_redirect() {
        let wrapped =
            "https://duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fpage%3Fx%3D1&rut=abc";
        assert_eq!(clean_result_url(wrapped), "https://example.com/page?x=1");
    }

    #[test]
    fn test_clean_result_url_handles_scheme_relative() {
        let wrapped = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2F";
        assert_eq!(clean_result_url(wrapped), "https://example.com/");
    }

    #[test]
    fn test_clean_result_url_passes_direct_links_through() {
        assert_eq!(
            clean_result_url("https://example.com/direct"),
            "https://example.com/direct"
        );
    }

    #[test]
    fn test_clean_result_url_tolerates_garbage() {
        assert_eq!(clean_result_url("not a url"), "not a url");
    }

    // ==================== Session Filing Tests ====================

    #[tokio::test]
    async fn test_search_results_are_filed_into_session() {
        let store = SessionStore::default();
        let id = store.create_session("rust browser pools").await;

        let results = vec![
            SearchResult {
                title: "First".to_string(),
                url: "https://a.example/one".to_string(),
                snippet: "the first hit".to_string(),
            },
            SearchResult {
                title: "Second".to_string(),
                url: "https://b.example/two".to_string(),
                snippet: "the second hit".to_string(),
            },
        ];

        file_search_results(&store, &id, &results).await.unwrap();

        let session = store.get_session(&id).await.unwrap();
        assert_eq!(session.results.len(), 2);
        assert_eq!(session.results[0].url, "https://a.example/one");
        assert_eq!(session.results[0].title, "First");
        assert_eq!(session.results[1].content, "the second hit");
    }

    #[tokio::test]
    async fn test_filing_into_unknown_session_errors() {
        let store = SessionStore::default();
        let results = vec![SearchResult {
            title: "t".to_string(),
            url: "https://a.example".to_string(),
            snippet: "s".to_string(),
        }];

        let err = file_search_results(&store, "ghost", &results)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSession(_)));
    }

    // ==================== Failure Reason Tests ====================

    #[test]
    fn test_failure_reason_labels() {
        assert_eq!(
            failure_reason(&NavigationError::DisallowedProtocol {
                scheme: "ftp".into()
            }),
            "validation"
        );
        assert_eq!(
            failure_reason(&NavigationError::RedirectBlocked {
                scheme: "data".into()
            }),
            "redirect_blocked"
        );
        assert_eq!(
            failure_reason(&NavigationError::Exhausted {
                attempts: 3,
                last_error: "bot protection detected".into()
            }),
            "bot_protection"
        );
        assert_eq!(
            failure_reason(&NavigationError::Exhausted {
                attempts: 3,
                last_error: "http status 503".into()
            }),
            "http_error"
        );
        assert_eq!(
            failure_reason(&NavigationError::Exhausted {
                attempts: 3,
                last_error: "something else".into()
            }),
            "exhausted"
        );
    }

    // ==================== Screenshot Store Tests ====================

    #[tokio::test]
    async fn test_screenshot_store_rejects_oversize() {
        let store = ScreenshotStore::new(ScreenshotConfig {
            dir: std::env::temp_dir().join("webscout-test-shots"),
            max_bytes: 16,
        });
        let result = store.persist(&[0u8; 64], "big page").await;
        assert!(matches!(result, Err(EngineError::Screenshot(_))));
    }

    #[tokio::test]
    async fn test_screenshot_store_writes_sanitized_name() {
        let dir = std::env::temp_dir().join(format!("webscout-test-{}", utils::ray_id()));
        let store = ScreenshotStore::new(ScreenshotConfig {
            dir: dir.clone(),
            max_bytes: 1024,
        });
        let path = store
            .persist(&[1u8, 2, 3], "Hello, World! A Title")
            .await
            .unwrap();
        assert!(path.contains("Hello__World"));
        assert!(path.ends_with(".png"));
        assert!(std::path::Path::new(&path).exists());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
