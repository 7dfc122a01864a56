//! Parsing and evaluation of the `Cache-Control` and `Age` response headers.

use http::HeaderMap;

use crate::clock::{Clock, Duration, Instant};

/// The parsed, evaluated set of cache directives for a single response.
///
/// Unlike [`http_cache_semantics::CachePolicy`] in the lineage crate, this
/// type does not attempt full RFC 7234 negotiation (no `Vary`, no conditional
/// revalidation) — it only answers "is a buffered copy of this response still
/// usable at instant `t`", which is all the coalescing Target needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRuleParameters {
    /// `max-age` directive value.
    pub max_age: Duration,
    /// `s-maxage` directive value (parsed, not separately consulted by `valid_at`).
    pub s_max_age: Duration,
    /// `no-cache` directive present.
    pub no_cache: bool,
    /// `must-revalidate` directive present.
    pub must_revalidate: bool,
    /// `proxy-revalidate` directive present.
    pub proxy_revalidate: bool,
    /// `no-store` directive present.
    pub no_store: bool,
    /// `private` directive present.
    pub private: bool,
    /// `public` directive present.
    pub public: bool,
    /// `must-understand` directive present.
    pub must_understand: bool,
    /// `no-transform` directive present.
    pub no_transform: bool,
    /// `immutable` directive present.
    pub immutable: bool,
    /// `stale-while-revalidate` directive value. Retained for a future
    /// revalidation pass; not consulted by `valid_at`.
    pub stale_while_revalidate: Duration,
    /// `stale-if-error` directive value. Retained for a future revalidation
    /// pass; not consulted by `valid_at`.
    pub stale_if_error: Duration,
    /// The instant from which `max_age` is measured, shifted earlier by any
    /// `Age` header seconds on the original response.
    pub age_base: Instant,
}

impl Default for CacheRuleParameters {
    fn default() -> Self {
        CacheRuleParameters {
            max_age: Duration::ZERO,
            s_max_age: Duration::ZERO,
            no_cache: false,
            must_revalidate: false,
            proxy_revalidate: false,
            no_store: false,
            private: false,
            public: false,
            must_understand: false,
            no_transform: false,
            immutable: false,
            stale_while_revalidate: Duration::ZERO,
            stale_if_error: Duration::ZERO,
            age_base: Instant::from_millis(0),
        }
    }
}

impl CacheRuleParameters {
    /// Is a response governed by these rules still usable at `instant`?
    ///
    /// `no-cache`/`no-store` always forbid reuse; `immutable` always allows
    /// it; otherwise reuse is allowed through the inclusive boundary
    /// `instant <= age_base + max_age`.
    pub fn valid_at(&self, instant: Instant) -> bool {
        if self.no_cache || self.no_store {
            return false;
        }
        if self.immutable {
            return true;
        }
        instant <= self.age_base.add(self.max_age)
    }
}

/// Extract [`CacheRuleParameters`] from a response's headers.
///
/// `Cache-Control` is split on `;` — not `,` as RFC 7234 specifies. This
/// preserves a faithful reimplementation of the reference behaviour rather
/// than correcting it; see the crate-level design notes.
pub fn extract_cache_rules(
    headers: &HeaderMap,
    now_clock: &dyn Clock,
) -> CacheRuleParameters {
    let now = now_clock.now();
    let mut rules = CacheRuleParameters { age_base: now, ..Default::default() };

    if let Some(value) = headers.get(http::header::CACHE_CONTROL) {
        if let Ok(value) = value.to_str() {
            for directive in value.split(';') {
                apply_directive(&mut rules, directive.trim());
            }
        }
    }

    let age = headers
        .get("age")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|secs| *secs >= 0)
        .unwrap_or(0);
    rules.age_base = now.subtract(Duration::from_secs(age));

    rules
}

fn apply_directive(rules: &mut CacheRuleParameters, directive: &str) {
    if directive.is_empty() {
        return;
    }
    let (name, value) = match directive.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value.trim())),
        None => (directive.trim(), None),
    };
    let seconds = || value.and_then(|v| v.trim_matches('"').parse::<i64>().ok());

    match name.to_ascii_lowercase().as_str() {
        "max-age" => rules.max_age = Duration::from_secs(seconds().unwrap_or(0)),
        "s-max-age" | "s-maxage" => {
            rules.s_max_age = Duration::from_secs(seconds().unwrap_or(0))
        }
        "stale-while-revalidate" => {
            rules.stale_while_revalidate =
                Duration::from_secs(seconds().unwrap_or(0))
        }
        "stale-if-error" => {
            rules.stale_if_error = Duration::from_secs(seconds().unwrap_or(0))
        }
        "no-cache" => rules.no_cache = true,
        "no-store" => rules.no_store = true,
        "must-revalidate" => rules.must_revalidate = true,
        "proxy-revalidate" => rules.proxy_revalidate = true,
        "private" => rules.private = true,
        "public" => rules.public = true,
        "must-understand" => rules.must_understand = true,
        "no-transform" => rules.no_transform = true,
        "immutable" => rules.immutable = true,
        _ => {}
    }
}
