//! Request classification: which caching discipline applies to a request.
//!
//! Classification is a pure function of the request against an ordered rule
//! list; first match wins. Only same-origin GET requests are ever
//! intercepted.

use reqwest::Method;
use serde::Deserialize;
use url::Url;

/// The three retrieval strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Serve from cache when present, hit the network otherwise.
  CacheFirst,
  /// Prefer the network, fall back to cache.
  NetworkFirst,
  /// Serve cache immediately, refresh it in the background.
  StaleWhileRevalidate,
}

/// How a rule matches a request path.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePattern {
  /// Path ends with one of these suffixes (asset extensions).
  Suffix(Vec<String>),
  /// Path starts with this prefix (API namespaces).
  Prefix(String),
}

impl RoutePattern {
  fn matches(&self, path: &str) -> bool {
    match self {
      Self::Suffix(suffixes) => suffixes.iter().any(|s| path.ends_with(s.as_str())),
      Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
    }
  }
}

/// One pattern → strategy rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
  #[serde(with = "serde_yaml::with::singleton_map")]
  pub pattern: RoutePattern,
  pub strategy: Strategy,
  /// Logical partition the response is cached into.
  pub partition: String,
}

/// Result of classifying an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
  pub strategy: Strategy,
  pub partition: String,
}

/// Classifies outbound requests against an ordered rule list.
pub struct Router {
  origin: Url,
  rules: Vec<RouteRule>,
  default_partition: String,
}

impl Router {
  pub fn new(origin: Url, rules: Vec<RouteRule>) -> Self {
    Self {
      origin,
      rules,
      default_partition: "dynamic".to_string(),
    }
  }

  /// The built-in rule set: static assets and images are cache-first, API
  /// calls network-first, secondary page fragments stale-while-revalidate.
  pub fn default_rules() -> Vec<RouteRule> {
    fn suffixes(list: &[&str]) -> RoutePattern {
      RoutePattern::Suffix(list.iter().map(|s| s.to_string()).collect())
    }

    vec![
      RouteRule {
        pattern: suffixes(&[".js", ".css", ".woff", ".woff2", ".ttf", ".ico", ".svg"]),
        strategy: Strategy::CacheFirst,
        partition: "static".to_string(),
      },
      RouteRule {
        pattern: suffixes(&[".png", ".jpg", ".jpeg", ".gif", ".webp"]),
        strategy: Strategy::CacheFirst,
        partition: "images".to_string(),
      },
      RouteRule {
        pattern: RoutePattern::Prefix("/partials/".to_string()),
        strategy: Strategy::StaleWhileRevalidate,
        partition: "dynamic".to_string(),
      },
      RouteRule {
        pattern: RoutePattern::Prefix("/api/".to_string()),
        strategy: Strategy::NetworkFirst,
        partition: "dynamic".to_string(),
      },
    ]
  }

  /// Classify one request. `None` means the request is not intercepted at
  /// all: non-GET methods and foreign origins pass through untouched.
  pub fn classify(&self, method: &Method, url: &Url) -> Option<RouteDecision> {
    if method != Method::GET {
      return None;
    }
    if url.origin() != self.origin.origin() {
      return None;
    }

    let path = url.path();
    for rule in &self.rules {
      if rule.pattern.matches(path) {
        return Some(RouteDecision {
          strategy: rule.strategy,
          partition: rule.partition.clone(),
        });
      }
    }

    // Same-origin GET with no specific rule: freshness over speed.
    Some(RouteDecision {
      strategy: Strategy::NetworkFirst,
      partition: self.default_partition.clone(),
    })
  }
}
