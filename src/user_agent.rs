//! Shared User-Agent strings for manifest and page requests.
//!
//! Library platforms throttle anonymous scrapers aggressively, so every
//! request identifies the tool and a contact URL.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/manuscript-downloader/manuscript-downloader";

/// User-Agent for page image requests.
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("manuscript-downloader/{version} (digital-humanities-tool; +{PROJECT_UA_URL})")
}

/// User-Agent for manifest and listing requests made by loaders.
#[must_use]
pub(crate) fn default_resolver_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("manuscript-downloader/{version} (manifest-resolver; +{PROJECT_UA_URL})")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_format_consistency() {
        for ua in [default_download_user_agent(), default_resolver_user_agent()] {
            assert!(ua.contains(PROJECT_UA_URL), "UA must contain project URL: {ua}");
            let version = ua
                .strip_prefix("manuscript-downloader/")
                .and_then(|s| s.split(' ').next())
                .unwrap();
            assert_eq!(version, env!("CARGO_PKG_VERSION"));
        }
    }

    #[test]
    fn test_ua_format_keywords() {
        assert!(default_download_user_agent().contains("digital-humanities-tool"));
        assert!(default_resolver_user_agent().contains("manifest-resolver"));
    }
}
