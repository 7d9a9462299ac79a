//! Declarative backend matching criteria
//!
//! Empty `url_patterns`, `domains`, `paths` or `schemes` mean "no constraint"
//! on that dimension. URL patterns use shell glob syntax (`*`, `?`, `[...]`,
//! `[!...]`); a pattern ending in `://` without glob characters is a plain
//! scheme prefix.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use url::Url;

use crate::error::{Error, Result};

/// Content type every HTML-capable backend declares
pub const HTML_CONTENT_TYPE: &str = "text/html";

/// Matches any content type
const ANY_CONTENT_TYPE: &str = "*/*";

// ============================================================================
// Backend Criteria
// ============================================================================

/// Rules deciding which URLs and content types a backend handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendCriteria {
    /// Higher wins
    pub priority: i32,

    /// Supported content types; `type/*` and `*/*` wildcards allowed
    pub content_types: BTreeSet<String>,

    /// Glob patterns matched against the URL or its host
    pub url_patterns: Vec<String>,

    /// Allowed URL schemes
    pub schemes: BTreeSet<String>,

    /// Allowed hosts (exact match)
    pub domains: BTreeSet<String>,

    /// Allowed path prefixes
    pub paths: Vec<String>,
}

impl Default for BackendCriteria {
    fn default() -> Self {
        Self {
            priority: 0,
            content_types: BTreeSet::from([HTML_CONTENT_TYPE.to_string()]),
            url_patterns: Vec::new(),
            schemes: BTreeSet::from(["http".to_string(), "https".to_string()]),
            domains: BTreeSet::new(),
            paths: Vec::new(),
        }
    }
}

impl BackendCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_content_types<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = content_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_url_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.url_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schemes = schemes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Compile the patterns once so matching stays allocation-free
    pub fn compile(&self) -> Result<CompiledCriteria> {
        let patterns = self
            .url_patterns
            .iter()
            .map(|p| UrlPattern::parse(p))
            .collect::<Result<Vec<_>>>()?;

        Ok(CompiledCriteria {
            criteria: self.clone(),
            patterns,
            schemes: lowercase_set(&self.schemes),
            domains: lowercase_set(&self.domains),
            content_types: lowercase_set(&self.content_types),
        })
    }
}

fn lowercase_set(values: &BTreeSet<String>) -> BTreeSet<String> {
    values.iter().map(|v| v.trim().to_ascii_lowercase()).collect()
}

/// Strip parameters (`; charset=...`) and normalize case
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

// ============================================================================
// URL Patterns
// ============================================================================

/// One compiled entry of `url_patterns`
#[derive(Debug, Clone)]
pub enum UrlPattern {
    /// `scheme://` style prefix
    Prefix(String),
    /// Shell glob
    Glob(Regex),
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let has_glob = pattern.contains(['*', '?', '[']);
        if pattern.ends_with("://") && !has_glob {
            return Ok(Self::Prefix(pattern.to_string()));
        }

        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| Error::config(format!("Invalid URL pattern '{pattern}': {e}")))?;
        Ok(Self::Glob(regex))
    }

    pub fn matches(&self, text: &str) -> bool {
        match self {
            Self::Prefix(prefix) => text.starts_with(prefix.as_str()),
            Self::Glob(regex) => regex.is_match(text),
        }
    }
}

/// Translate a shell glob into an anchored regex
fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^(?s:");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => {
                out.push_str(".*");
                i += 1;
            }
            '?' => {
                out.push('.');
                i += 1;
            }
            '[' => match class_end(&chars, i + 1) {
                Some(end) => {
                    out.push_str(&char_class(&chars[i + 1..end]));
                    i = end + 1;
                }
                None => {
                    out.push_str("\\[");
                    i += 1;
                }
            },
            c => {
                out.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }

    out.push_str(")$");
    out
}

/// Index of the `]` closing a class that opened just before `start`
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start;
    if chars.get(j) == Some(&'!') {
        j += 1;
    }
    // a leading `]` is a literal member
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    (j..chars.len()).find(|&k| chars[k] == ']')
}

fn char_class(body: &[char]) -> String {
    let mut out = String::from("[");
    let mut members = body;

    if let Some(('!', rest)) = members.split_first() {
        out.push('^');
        members = rest;
    }

    for (idx, &c) in members.iter().enumerate() {
        match c {
            '\\' | '[' | ']' | '&' | '~' => {
                out.push('\\');
                out.push(c);
            }
            '^' if idx == 0 => out.push_str("\\^"),
            _ => out.push(c),
        }
    }

    out.push(']');
    out
}

// ============================================================================
// Compiled Criteria
// ============================================================================

/// Criteria with patterns compiled and sets normalized
#[derive(Debug, Clone)]
pub struct CompiledCriteria {
    criteria: BackendCriteria,
    patterns: Vec<UrlPattern>,
    schemes: BTreeSet<String>,
    domains: BTreeSet<String>,
    content_types: BTreeSet<String>,
}

impl CompiledCriteria {
    pub fn criteria(&self) -> &BackendCriteria {
        &self.criteria
    }

    pub fn priority(&self) -> i32 {
        self.criteria.priority
    }

    /// Scheme, domain, path and pattern constraints
    pub fn url_matches(&self, raw_url: &str, url: &Url) -> bool {
        if !self.schemes.is_empty() && !self.schemes.contains(url.scheme()) {
            return false;
        }

        let host = url.host_str().unwrap_or_default();
        if !self.domains.is_empty() && !self.domains.contains(host) {
            return false;
        }

        if !self.criteria.paths.is_empty()
            && !self
                .criteria
                .paths
                .iter()
                .any(|prefix| url.path().starts_with(prefix.as_str()))
        {
            return false;
        }

        if !self.patterns.is_empty() {
            let netloc = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            if !self
                .patterns
                .iter()
                .any(|p| p.matches(raw_url) || p.matches(&netloc))
            {
                return false;
            }
        }

        true
    }

    /// Declared support: literal entry or a `type/*` wildcard
    pub fn explicitly_supports(&self, content_type: &str) -> bool {
        let content_type = normalize_content_type(content_type);
        if self.content_types.contains(&content_type) {
            return true;
        }

        self.content_types.iter().any(|declared| {
            declared
                .strip_suffix('*')
                .filter(|prefix| prefix.ends_with('/') && *prefix != "*/")
                .is_some_and(|prefix| content_type.starts_with(prefix))
        })
    }

    /// `None` always matches; otherwise explicit support or `*/*`
    pub fn content_type_matches(&self, content_type: Option<&str>) -> bool {
        match content_type {
            None => true,
            Some(ct) => self.content_types.contains(ANY_CONTENT_TYPE) || self.explicitly_supports(ct),
        }
    }

    pub fn supports_html(&self) -> bool {
        self.explicitly_supports(HTML_CONTENT_TYPE)
    }
}
