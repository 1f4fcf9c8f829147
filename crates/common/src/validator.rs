//! Multi-signal page validation.
//!
//! `collect_signals` takes one snapshot from the live page; `evaluate` is a
//! pure function over that snapshot. Any single failing signal invalidates
//! the page; the check order only affects which reason gets reported.

use headless_chrome::browser::tab::Tab;
use std::sync::Arc;
use thiserror::Error;

use crate::types::PageSignals;

/// DOM markers of bot-protection challenges: Cloudflare interstitials,
/// captcha widgets, WAF challenge markup.
pub const CHALLENGE_SELECTORS: &[&str] = &[
    "#challenge-form",
    "#challenge-running",
    "#cf-challenge-running",
    ".cf-browser-verification",
    "#cf-please-wait",
    "#turnstile-wrapper",
    "iframe[src*='challenges.cloudflare.com']",
    ".g-recaptcha",
    "iframe[src*='recaptcha']",
    ".h-captcha",
    "iframe[src*='hcaptcha']",
    "#px-captcha",
];

/// Title fragments that mark challenge or verification interstitials.
pub const SUSPICIOUS_TITLE_PHRASES: &[&str] = &[
    "just a moment",
    "attention required",
    "verify you are human",
    "verify human",
    "checking your browser",
    "verification required",
    "security check",
];

/// Body fragments that mark served-but-useless error pages.
pub const ERROR_PAGE_PHRASES: &[&str] = &[
    "404 not found",
    "403 forbidden",
    "page not found",
    "access denied",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "internal server error",
    "this page isn't working",
];

const MALICIOUS_SCHEMES: &[&str] = &["data:", "javascript:", "vbscript:"];

/// Why a loaded page was judged unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("bot protection detected")]
    BotProtection { marker: String },

    #[error("suspicious page title {title:?}")]
    SuspiciousTitle { title: String },

    #[error("final url uses blocked scheme {scheme:?}")]
    MaliciousScheme { scheme: String },

    #[error("error page detected ({phrase})")]
    ErrorPage { phrase: String },

    #[error("insufficient content: {words} words (minimum {min})")]
    InsufficientContent { words: usize, min: usize },
}

impl ValidationFailure {
    /// Bot-protection failures are final for the attempt: waiting and
    /// re-checking cannot clear an active challenge wall.
    pub fn is_bot_protection(&self) -> bool {
        matches!(self, Self::BotProtection { .. })
    }
}

/// Judge a signal snapshot. `Ok(())` means the page is usable.
pub fn evaluate(signals: &PageSignals, min_content_words: usize) -> Result<(), ValidationFailure> {
    if let Some(marker) = &signals.challenge_marker {
        return Err(ValidationFailure::BotProtection {
            marker: marker.clone(),
        });
    }

    let title = signals.title.to_lowercase();
    if SUSPICIOUS_TITLE_PHRASES.iter().any(|p| title.contains(p)) {
        return Err(ValidationFailure::SuspiciousTitle {
            title: signals.title.clone(),
        });
    }

    let final_url = signals.final_url.trim().to_lowercase();
    if let Some(scheme) = MALICIOUS_SCHEMES.iter().find(|s| final_url.starts_with(**s)) {
        return Err(ValidationFailure::MaliciousScheme {
            scheme: scheme.trim_end_matches(':').to_string(),
        });
    }

    let body = signals.body_excerpt.to_lowercase();
    if let Some(phrase) = ERROR_PAGE_PHRASES.iter().find(|p| body.contains(**p)) {
        return Err(ValidationFailure::ErrorPage {
            phrase: (*phrase).to_string(),
        });
    }

    if signals.word_count < min_content_words {
        return Err(ValidationFailure::InsufficientContent {
            words: signals.word_count,
            min: min_content_words,
        });
    }

    Ok(())
}

/// Collect the validation signals from the live page in one evaluation.
///
/// Synchronous CDP call; run it inside `spawn_blocking` from async contexts.
pub fn collect_signals(tab: &Arc<Tab>) -> anyhow::Result<PageSignals> {
    let selectors_json = serde_json::to_string(CHALLENGE_SELECTORS)?;

    let js_code = format!(
        r#"
        (() => {{
            const markers = {selectors_json};
            let marker = null;
            for (const sel of markers) {{
                try {{
                    if (document.querySelector(sel)) {{ marker = sel; break; }}
                }} catch (e) {{}}
            }}
            const body = document.body ? (document.body.innerText || '') : '';
            const words = body.split(/\s+/).filter(w => w.length > 0).length;
            return JSON.stringify({{
                final_url: window.location.href,
                title: document.title || '',
                body_excerpt: body.slice(0, 4000).toLowerCase(),
                word_count: words,
                challenge_marker: marker
            }});
        }})()
        "#
    );

    let result = tab.evaluate(&js_code, false)?;

    match result.value {
        Some(serde_json::Value::String(json_str)) => {
            let signals: PageSignals = serde_json::from_str(&json_str)?;
            Ok(signals)
        }
        other => Err(anyhow::anyhow!(
            "unexpected signal collection result: {:?}",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_signals() -> PageSignals {
        PageSignals {
            final_url: "https://example.com/article".to_string(),
            title: "A perfectly normal article".to_string(),
            body_excerpt: "plain readable prose about something".to_string(),
            word_count: 500,
            challenge_marker: None,
        }
    }

    // ==================== Bot Protection Tests ====================

    #[test]
    fn test_challenge_marker_invalidates_regardless_of_word_count() {
        let mut signals = valid_signals();
        signals.challenge_marker = Some("#challenge-form".to_string());
        signals.word_count = 10_000;

        let err = evaluate(&signals, 50).unwrap_err();
        assert!(err.is_bot_protection());
        assert_eq!(err.to_string(), "bot protection detected");
    }

    #[test]
    fn test_bot_protection_is_deterministic() {
        let mut signals = valid_signals();
        signals.challenge_marker = Some(".g-recaptcha".to_string());

        for _ in 0..3 {
            assert!(evaluate(&signals, 50).unwrap_err().is_bot_protection());
        }
    }

    // ==================== Title Tests ====================

    #[test]
    fn test_suspicious_titles() {
        for title in ["Just a Moment...", "Attention Required! | Gateway", "Verify you are human"] {
            let mut signals = valid_signals();
            signals.title = title.to_string();
            assert!(matches!(
                evaluate(&signals, 50),
                Err(ValidationFailure::SuspiciousTitle { .. })
            ));
        }
    }

    #[test]
    fn test_ordinary_title_passes() {
        let mut signals = valid_signals();
        signals.title = "Moments in history".to_string();
        assert!(evaluate(&signals, 50).is_ok());
    }

    // ==================== Scheme Tests ====================

    #[test]
    fn test_malicious_final_url_schemes() {
        for (url, scheme) in [
            ("data:text/html,<h1>hi</h1>", "data"),
            ("javascript:alert(1)", "javascript"),
        ] {
            let mut signals = valid_signals();
            signals.final_url = url.to_string();
            assert_eq!(
                evaluate(&signals, 50),
                Err(ValidationFailure::MaliciousScheme {
                    scheme: scheme.to_string()
                })
            );
        }
    }

    // ==================== Error Page Tests ====================

    #[test]
    fn test_error_page_phrases() {
        let mut signals = valid_signals();
        signals.body_excerpt = "Error: 404 Not Found. The requested resource is gone.".to_string();
        assert!(matches!(
            evaluate(&signals, 50),
            Err(ValidationFailure::ErrorPage { .. })
        ));
    }

    #[test]
    fn test_error_page_reported_before_word_count() {
        // A thin error page should be called an error page, not thin content.
        let mut signals = valid_signals();
        signals.body_excerpt = "access denied".to_string();
        signals.word_count = 2;
        assert!(matches!(
            evaluate(&signals, 50),
            Err(ValidationFailure::ErrorPage { .. })
        ));
    }

    // ==================== Content Tests ====================

    #[test]
    fn test_insufficient_content() {
        let mut signals = valid_signals();
        signals.word_count = 12;
        assert_eq!(
            evaluate(&signals, 50),
            Err(ValidationFailure::InsufficientContent { words: 12, min: 50 })
        );
    }

    #[test]
    fn test_word_count_at_threshold_passes() {
        let mut signals = valid_signals();
        signals.word_count = 50;
        assert!(evaluate(&signals, 50).is_ok());
    }

    #[test]
    fn test_clean_page_is_valid() {
        assert!(evaluate(&valid_signals(), 50).is_ok());
    }
}
