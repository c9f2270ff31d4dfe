//! Source URL resolution: proxy rewrite for origins that need the local relay
//! and cache busting for repeated attempts.

use radio_proto::config::ProxyConfig;
use reqwest::Url;

/// Query parameter appended from the second attempt on.
pub const CACHE_BUST_PARAM: &str = "_cb";

#[derive(Debug, Clone, Default)]
pub struct ProxyRewrite {
    domains: Vec<String>,
    base_url: String,
}

impl ProxyRewrite {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            domains: config
                .domains
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn requires_proxy(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }

    /// Resolve `url` for load attempt number `attempt` (1-based) on a slot.
    pub fn resolve(&self, url: &str, attempt: u32) -> String {
        let Ok(mut parsed) = Url::parse(url) else {
            // Not an absolute URL (local file, mpv-specific scheme): pass through.
            return url.to_string();
        };

        if attempt >= 2 {
            let stamp = chrono::Utc::now().timestamp_millis().to_string();
            parsed.query_pairs_mut().append_pair(CACHE_BUST_PARAM, &stamp);
        }

        if self.requires_proxy(&parsed) {
            if let Ok(mut relay) = Url::parse(&format!("{}/relay", self.base_url)) {
                relay.query_pairs_mut().append_pair("url", parsed.as_str());
                return relay.into();
            }
        }

        parsed.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(domains: &[&str]) -> ProxyRewrite {
        ProxyRewrite::new(&ProxyConfig {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            base_url: "http://127.0.0.1:8990/".to_string(),
        })
    }

    #[test]
    fn first_attempt_is_untouched() {
        let r = rewrite(&[]);
        assert_eq!(
            r.resolve("https://ice.example.org/live.mp3", 1),
            "https://ice.example.org/live.mp3"
        );
    }

    #[test]
    fn repeated_attempts_are_cache_busted() {
        let r = rewrite(&[]);
        let url = r.resolve("https://ice.example.org/live.mp3?sid=1", 2);
        assert!(url.starts_with("https://ice.example.org/live.mp3?sid=1&_cb="));
    }

    #[test]
    fn proxied_domains_go_through_the_relay() {
        let r = rewrite(&["geo.example"]);
        let url = r.resolve("https://edge1.geo.example/stream", 1);
        assert!(url.starts_with("http://127.0.0.1:8990/relay?url="));
        let relay = Url::parse(&url).unwrap();
        let (_, original) = relay.query_pairs().next().unwrap();
        assert_eq!(original, "https://edge1.geo.example/stream");

        // suffix match is on label boundaries only
        assert_eq!(
            r.resolve("https://notgeo.example/stream", 1),
            "https://notgeo.example/stream"
        );
    }

    #[test]
    fn non_urls_pass_through() {
        let r = rewrite(&["geo.example"]);
        assert_eq!(r.resolve("/music/local.flac", 3), "/music/local.flac");
    }
}
