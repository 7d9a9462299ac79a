//! Best-fit backend selection
//!
//! Selection is a pure function of the registry contents:
//!
//! 1. every registration is tested for a URL match (scheme, domain, path,
//!    pattern) and a content-type match;
//! 2. candidates fall into the `exact`, `url_only` and `fallback` buckets;
//! 3. the first non-empty bucket wins, ordered by priority (descending), then
//!    HTML support when no content type was given, then name (ascending);
//! 4. for a handful of ambiguous XML-like content types, the highest
//!    priority registration overall is used when every bucket is empty.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use super::criteria::{normalize_content_type, CompiledCriteria};
use super::registry::BackendRegistry;
use super::Backend;
use crate::error::Result;

/// Content types that may be served by any backend when nothing else fits
const ABSOLUTE_FALLBACK_CONTENT_TYPES: &[&str] =
    &["application/xml", "text/xml", "application/xhtml+xml"];

struct Candidate<'a> {
    name: &'a str,
    priority: i32,
    supports_html: bool,
}

/// Chooses a backend for a URL and optional content type
#[derive(Debug, Clone)]
pub struct BackendSelector {
    registry: Arc<BackendRegistry>,
}

impl BackendSelector {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Name of the best-fit backend, or `None` when nothing matches
    pub fn select(&self, url: &str, content_type: Option<&str>) -> Option<String> {
        let parsed = Url::parse(url).ok();
        let entries = self.registry.read();

        let mut exact = Vec::new();
        let mut url_only = Vec::new();
        let mut fallback = Vec::new();

        for (name, entry) in entries.iter() {
            let matcher = &entry.matcher;
            let url_match = parsed
                .as_ref()
                .is_some_and(|parsed| matcher.url_matches(url, parsed));
            if !url_match {
                continue;
            }

            let is_exact = match content_type {
                Some(ct) => matcher.explicitly_supports(ct),
                None => matcher.supports_html(),
            };
            if is_exact {
                exact.push(candidate_of(name, matcher));
            }

            if matcher.content_type_matches(content_type) {
                url_only.push(candidate_of(name, matcher));
                fallback.push(candidate_of(name, matcher));
            }
        }

        let prefer_html = content_type.is_none();
        let selected = best(exact, prefer_html)
            .or_else(|| best(url_only, prefer_html))
            .or_else(|| best(fallback, prefer_html))
            .or_else(|| {
                let ct = normalize_content_type(content_type?);
                if !ABSOLUTE_FALLBACK_CONTENT_TYPES.contains(&ct.as_str()) {
                    return None;
                }
                let everything = entries
                    .iter()
                    .map(|(name, entry)| candidate_of(name, &entry.matcher))
                    .collect();
                best(everything, false)
            })
            .map(str::to_string);

        debug!(url = %url, content_type = ?content_type, backend = ?selected, "Backend selection");
        selected
    }

    /// Resolve the selected backend through the registry
    pub fn select_backend(
        &self,
        url: &str,
        content_type: Option<&str>,
    ) -> Result<Option<Arc<dyn Backend>>> {
        match self.select(url, content_type) {
            Some(name) => self.registry.get_backend(&name).map(Some),
            None => Ok(None),
        }
    }
}

fn candidate_of<'a>(name: &'a str, matcher: &CompiledCriteria) -> Candidate<'a> {
    Candidate {
        name,
        priority: matcher.priority(),
        supports_html: matcher.supports_html(),
    }
}

fn best<'a>(mut candidates: Vec<Candidate<'a>>, prefer_html: bool) -> Option<&'a str> {
    candidates.sort_by(|a, b| rank(a, b, prefer_html));
    candidates.first().map(|c| c.name)
}

fn rank(a: &Candidate<'_>, b: &Candidate<'_>, prefer_html: bool) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| {
            if prefer_html {
                b.supports_html.cmp(&a.supports_html)
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| a.name.cmp(b.name))
}
