//! Client classification capability interface.

/// Classifies clients from their user agent.
///
/// Crawler and mobile detection live behind this trait so the external
/// classifier collaborator can be injected into the accountant rather than
/// hard-wired.
pub trait ClientClassifier: Send + Sync {
    /// Whether the user agent belongs to a crawler.
    fn is_crawler(&self, user_agent: &str) -> bool;

    /// Whether the user agent belongs to a mobile browser.
    fn is_mobile(&self, user_agent: &str) -> bool;
}

/// Substring-based classifier over well-known user-agent markers.
pub struct UserAgentClassifier {
    crawler_markers: Vec<&'static str>,
    mobile_markers: Vec<&'static str>,
}

impl Default for UserAgentClassifier {
    fn default() -> Self {
        Self {
            crawler_markers: vec![
                "bot", "crawler", "spider", "slurp", "curl", "wget", "facebookexternalhit",
            ],
            mobile_markers: vec!["mobile", "android", "iphone", "ipad", "webos"],
        }
    }
}

impl ClientClassifier for UserAgentClassifier {
    fn is_crawler(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        self.crawler_markers.iter().any(|marker| ua.contains(marker))
    }

    fn is_mobile(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        self.mobile_markers.iter().any(|marker| ua.contains(marker))
    }
}
