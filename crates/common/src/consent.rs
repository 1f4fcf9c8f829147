//! Consent-wall knowledge: which domains sit behind regional consent
//! interstitials, which cookies pre-empt them, and which button phrases mean
//! "accept" across locales.
//!
//! The phrase table is static. Matching is case-insensitive substring over
//! candidate button text, so no runtime language detection is involved.

/// One accept-button phrase and the locale it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentPhrase {
    pub locale: &'static str,
    pub phrase: &'static str,
}

/// Accept-control phrases, multilingual. Longer phrases first within a locale
/// so the reported match is the most specific one.
pub const ACCEPT_PHRASES: &[ConsentPhrase] = &[
    ConsentPhrase { locale: "en", phrase: "accept all" },
    ConsentPhrase { locale: "en", phrase: "accept cookies" },
    ConsentPhrase { locale: "en", phrase: "allow all" },
    ConsentPhrase { locale: "en", phrase: "i agree" },
    ConsentPhrase { locale: "en", phrase: "agree" },
    ConsentPhrase { locale: "en", phrase: "consent" },
    ConsentPhrase { locale: "en", phrase: "got it" },
    ConsentPhrase { locale: "en", phrase: "accept" },
    ConsentPhrase { locale: "de", phrase: "alle akzeptieren" },
    ConsentPhrase { locale: "de", phrase: "akzeptieren" },
    ConsentPhrase { locale: "de", phrase: "zustimmen" },
    ConsentPhrase { locale: "de", phrase: "einverstanden" },
    ConsentPhrase { locale: "fr", phrase: "tout accepter" },
    ConsentPhrase { locale: "fr", phrase: "j'accepte" },
    ConsentPhrase { locale: "fr", phrase: "accepter" },
    ConsentPhrase { locale: "es", phrase: "aceptar todo" },
    ConsentPhrase { locale: "es", phrase: "aceptar" },
    ConsentPhrase { locale: "it", phrase: "accetta tutto" },
    ConsentPhrase { locale: "it", phrase: "accetta" },
    ConsentPhrase { locale: "nl", phrase: "alles accepteren" },
    ConsentPhrase { locale: "nl", phrase: "accepteren" },
    ConsentPhrase { locale: "nl", phrase: "akkoord" },
    ConsentPhrase { locale: "pt", phrase: "aceitar tudo" },
    ConsentPhrase { locale: "pt", phrase: "aceitar" },
    ConsentPhrase { locale: "pl", phrase: "zaakceptuj wszystkie" },
    ConsentPhrase { locale: "pl", phrase: "akceptuj" },
    ConsentPhrase { locale: "sv", phrase: "godkänn alla" },
    ConsentPhrase { locale: "sv", phrase: "acceptera" },
    ConsentPhrase { locale: "da", phrase: "accepter alle" },
    ConsentPhrase { locale: "no", phrase: "godta alle" },
    ConsentPhrase { locale: "fi", phrase: "hyväksy kaikki" },
    ConsentPhrase { locale: "cs", phrase: "přijmout vše" },
    ConsentPhrase { locale: "cs", phrase: "souhlasím" },
    ConsentPhrase { locale: "ro", phrase: "acceptă tot" },
    ConsentPhrase { locale: "hu", phrase: "elfogadom" },
    ConsentPhrase { locale: "el", phrase: "αποδοχή όλων" },
    ConsentPhrase { locale: "ru", phrase: "принять все" },
    ConsentPhrase { locale: "tr", phrase: "tümünü kabul et" },
    ConsentPhrase { locale: "tr", phrase: "kabul et" },
    ConsentPhrase { locale: "ja", phrase: "すべて同意" },
    ConsentPhrase { locale: "ja", phrase: "同意する" },
    ConsentPhrase { locale: "zh", phrase: "全部接受" },
    ConsentPhrase { locale: "zh", phrase: "接受" },
];

/// Phrases that veto a candidate even when an accept phrase also matches
/// ("disagree" contains "agree").
const REJECT_PHRASES: &[&str] = &[
    "reject",
    "decline",
    "disagree",
    "deny",
    "refuse",
    "no thanks",
    "only necessary",
    "ablehnen",
    "verweigern",
    "refuser",
    "rechazar",
    "rifiuta",
    "weigeren",
    "odmítnout",
    "avvisa",
];

/// Domains known to interpose a regional consent wall. Matched by exact host
/// or dot-suffix, so `www.google.de` matches `google.de`.
pub const CONSENT_REGION_DOMAINS: &[&str] = &[
    "google.com",
    "google.co.uk",
    "google.de",
    "google.fr",
    "google.it",
    "google.es",
    "google.nl",
    "google.pl",
    "google.be",
    "google.at",
    "google.ch",
    "google.ie",
    "google.pt",
    "google.se",
    "google.dk",
    "google.no",
    "google.fi",
    "google.cz",
    "google.ro",
    "google.hu",
    "google.gr",
    "youtube.com",
    "duckduckgo.com",
];

// Values that pre-date the EU consent prompt for the google family; harmless
// elsewhere.
const CONSENT_COOKIE_VALUE: &str = "YES+cb.20220419-08-p0.en+FX+917";
const SOCS_COOKIE_VALUE: &str = "CAISHAgBEhJnd3NfMjAyMjA0MTktMF9SQzEaAmVuIAEaBgiAo5KTBg";

/// A cookie to seed before navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentCookie {
    pub name: &'static str,
    pub value: &'static str,
    /// Cookie domain scope. Dot-prefixed for region-wide variants.
    pub domain: String,
}

/// Match a host against the consent-region list. Returns the matched region
/// domain so callers can scope cookies to it.
pub fn consent_region(host: &str) -> Option<&'static str> {
    let host = host.to_lowercase();
    CONSENT_REGION_DOMAINS
        .iter()
        .find(|d| host == **d || host.ends_with(&format!(".{}", d)))
        .copied()
}

pub fn is_consent_region(host: &str) -> bool {
    consent_region(host).is_some()
}

/// Cookies to seed for a target host: a pair scoped to the host itself, plus
/// region-wide dot-domain variants when the host sits in a consent region.
pub fn consent_cookies_for(host: &str) -> Vec<ConsentCookie> {
    let mut cookies = vec![
        ConsentCookie {
            name: "CONSENT",
            value: CONSENT_COOKIE_VALUE,
            domain: host.to_string(),
        },
        ConsentCookie {
            name: "SOCS",
            value: SOCS_COOKIE_VALUE,
            domain: host.to_string(),
        },
    ];

    if let Some(region) = consent_region(host) {
        cookies.push(ConsentCookie {
            name: "CONSENT",
            value: CONSENT_COOKIE_VALUE,
            domain: format!(".{}", region),
        });
        cookies.push(ConsentCookie {
            name: "SOCS",
            value: SOCS_COOKIE_VALUE,
            domain: format!(".{}", region),
        });
    }

    cookies
}

/// Case-insensitive accept-phrase lookup over a candidate control's text.
/// Reject-phrase hits veto the candidate entirely.
pub fn matches_accept_phrase(text: &str) -> Option<&'static ConsentPhrase> {
    let lowered = text.to_lowercase();
    if REJECT_PHRASES.iter().any(|p| lowered.contains(p)) {
        return None;
    }
    ACCEPT_PHRASES.iter().find(|p| lowered.contains(p.phrase))
}

/// CSS selector matching likely consent dialog/banner containers.
pub fn container_selector() -> &'static str {
    "[role=dialog], [class*=consent], [id*=consent], [class*=cookie], [id*=cookie], [class*=banner], [class*=modal]"
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Region Matching Tests ====================

    #[test]
    fn test_region_match_exact_and_subdomain() {
        assert_eq!(consent_region("google.de"), Some("google.de"));
        assert_eq!(consent_region("www.google.com"), Some("google.com"));
        assert_eq!(consent_region("consent.youtube.com"), Some("youtube.com"));
    }

    #[test]
    fn test_region_match_rejects_lookalikes() {
        assert_eq!(consent_region("example.com"), None);
        assert_eq!(consent_region("notgoogle.com"), None);
        assert_eq!(consent_region("google.com.evil.net"), None);
    }

    #[test]
    fn test_region_match_is_case_insensitive() {
        assert_eq!(consent_region("WWW.Google.COM"), Some("google.com"));
    }

    // ==================== Cookie Seeding Tests ====================

    #[test]
    fn test_cookies_for_plain_host() {
        let cookies = consent_cookies_for("example.com");
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|c| c.domain == "example.com"));
        assert!(cookies.iter().any(|c| c.name == "CONSENT"));
        assert!(cookies.iter().any(|c| c.name == "SOCS"));
    }

    #[test]
    fn test_cookies_for_region_host_add_scoped_variants() {
        let cookies = consent_cookies_for("www.google.de");
        assert_eq!(cookies.len(), 4);
        assert!(cookies.iter().any(|c| c.domain == "www.google.de"));
        assert!(cookies.iter().any(|c| c.domain == ".google.de"));
    }

    // ==================== Phrase Matching Tests ====================

    #[test]
    fn test_accept_phrase_case_insensitive() {
        let hit = matches_accept_phrase("ACCEPT ALL").expect("should match");
        assert_eq!(hit.phrase, "accept all");
        assert_eq!(hit.locale, "en");
    }

    #[test]
    fn test_accept_phrase_multilingual() {
        assert!(matches_accept_phrase("Alle akzeptieren").is_some());
        assert!(matches_accept_phrase("Tout accepter").is_some());
        assert!(matches_accept_phrase("全部接受").is_some());
    }

    #[test]
    fn test_accept_phrase_substring() {
        // Real buttons carry surrounding text.
        assert!(matches_accept_phrase("  Accept all cookies and close  ").is_some());
    }

    #[test]
    fn test_reject_phrases_veto() {
        assert!(matches_accept_phrase("Disagree").is_none());
        assert!(matches_accept_phrase("Reject all").is_none());
        assert!(matches_accept_phrase("Alle ablehnen").is_none());
        assert!(matches_accept_phrase("Accept only necessary cookies").is_none());
    }

    #[test]
    fn test_unrelated_text_does_not_match() {
        assert!(matches_accept_phrase("Read our privacy policy").is_none());
        assert!(matches_accept_phrase("Settings").is_none());
    }
}
