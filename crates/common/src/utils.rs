/// Extract domain from URL
pub fn extract_domain(url: &str) -> anyhow::Result<String> {
    url::Url::parse(url)?
        .host_str()
        .map(|h| h.to_string())
        .ok_or_else(|| anyhow::anyhow!("No host in URL"))
}

/// Short correlation id for request tracing in logs.
pub fn ray_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Reduce a page title to something safe for a filename: alphanumerics,
/// dashes and underscores, bounded length, never empty.
pub fn sanitize_filename(title: &str, max_len: usize) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed: String = cleaned.chars().take(max_len).collect();
    let trimmed = trimmed.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "page".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://example.com/path").unwrap(),
            "example.com"
        );
        assert_eq!(
            extract_domain("http://sub.example.com:8080/path").unwrap(),
            "sub.example.com"
        );
    }

    #[test]
    fn test_extract_domain_rejects_garbage() {
        assert!(extract_domain("not a url").is_err());
        assert!(extract_domain("data:text/html,hello").is_err());
    }

    #[test]
    fn test_ray_id_shape() {
        let id = ray_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Hello, World!", 64), "Hello__World");
        assert_eq!(sanitize_filename("résumé", 64), "r_sum");
        assert_eq!(sanitize_filename("///", 64), "page");
        assert_eq!(sanitize_filename("", 64), "page");
    }

    #[test]
    fn test_sanitize_filename_bounds_length() {
        let long = "a".repeat(200);
        assert_eq!(sanitize_filename(&long, 32).len(), 32);
    }
}
