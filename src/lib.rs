//! Lazy, visibility-driven web font loading with request deduplication.
//!
//! Elements that want a web font are scheduled with a [`FontLoader`]. Each
//! element carries a font family, a URL, and an optional descriptor set; the
//! loader waits until the element becomes relevant (per an injected
//! [`VisibilityWatcher`]), fetches the font through an injected
//! [`FontFetcher`], and registers the result in a process-wide
//! [`FontRegistry`](cache::FontRegistry). Concurrent requests for the same
//! font share a single fetch, and every element exposes its own loading
//! status plus an awaitable completion handle.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use webfont_loader::{
//!     FetchError, FontFetcher, FontLoader, FontRequest, ImmediateVisibility, LoadedFont,
//! };
//!
//! struct StaticFetcher;
//!
//! impl FontFetcher for StaticFetcher {
//!     fn fetch(&self, request: &FontRequest) -> Result<LoadedFont, FetchError> {
//!         Ok(LoadedFont {
//!             family: request.family.clone(),
//!             url: request.url.clone(),
//!             bytes: Vec::new(),
//!         })
//!     }
//! }
//!
//! let loader = FontLoader::new(Arc::new(StaticFetcher), Arc::new(ImmediateVisibility));
//! assert!(loader.registry().is_empty());
//! ```

pub mod cache;
pub mod loader;


use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use cache::{FetchCache, FetchOutcome, FetchSlot, FontRegistry};
pub use loader::{
    CompletionHandle, FontLoader, ImmediateVisibility, LoadOutcome, ScheduleHandle,
    ScheduleOptions, ScheduleOutcome, VisibilityOptions, VisibilityWatcher, WatchSubscription,
};

// ── Status ──────────────────────────────────────────────────────────────────

/// Per-element loading status, readable by presentation layers.
///
/// Transitions are monotonic within one registration:
/// `Unloaded → Loading → {Loaded, Error}`. The loader never resets a
/// terminal status; clearing it is the caller's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

impl LoadStatus {
    /// The markup-facing status value.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Unloaded => "unloaded",
            LoadStatus::Loading => "loading",
            LoadStatus::Loaded => "loaded",
            LoadStatus::Error => "error",
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Elements ────────────────────────────────────────────────────────────────

/// An opaque page element that wants a web font.
///
/// The metadata accessors expose whatever is attached to the element in the
/// host document; the status accessors back the mutable status field the
/// loader writes to. `status()` returns `None` for an element the loader has
/// never touched.
pub trait FontElement: Send + Sync {
    /// Requested font family name, as written in the markup (unsanitized).
    fn font_family(&self) -> Option<String>;

    /// URL of the font resource.
    fn font_url(&self) -> Option<String>;

    /// Raw descriptor blob attached to the element, if any. Expected to be a
    /// serialized JSON object mapping descriptor names to string values.
    fn font_descriptors(&self) -> Option<String>;

    fn status(&self) -> Option<LoadStatus>;

    fn set_status(&self, status: LoadStatus);
}

// ── Fetch primitive ─────────────────────────────────────────────────────────

/// A font loaded by the fetch primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedFont {
    /// Sanitized family name the font was requested under.
    pub family: String,
    pub url: String,
    pub bytes: Vec<u8>,
}

/// The external font-fetch collaborator.
///
/// One `fetch` call is made per canonical request key, no matter how many
/// elements share that key. The loader never retries a failed fetch on its
/// own; a later request for the same key starts a fresh call.
pub trait FontFetcher: Send + Sync {
    fn fetch(&self, request: &FontRequest) -> Result<LoadedFont, FetchError>;
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// Failure reported by a [`FontFetcher`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct FetchError {
    pub reason: String,
}

impl FetchError {
    pub fn new(reason: impl Into<String>) -> Self {
        FetchError {
            reason: reason.into(),
        }
    }
}

/// Per-element loading failure, delivered through the completion handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FontError {
    /// The element is missing a required metadata field; no fetch was
    /// attempted.
    #[error("element is missing required font metadata: {0}")]
    MissingMetadata(&'static str),

    /// The underlying fetch failed. The cache entry for the key was evicted,
    /// so a later request retries instead of replaying this failure.
    #[error("font fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The element already carries a terminal `error` status from an earlier
    /// registration. Clear the status and re-schedule to retry.
    #[error("font previously failed to load; clear the element status to retry")]
    PreviouslyFailed,
}

// ── Request descriptor builder ──────────────────────────────────────────────

/// A normalized font request: the canonical identity of one font resource.
///
/// Two requests with equal [`cache_key`](FontRequest::cache_key) values share
/// one fetch and one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FontRequest {
    /// Sanitized family name (see [`sanitize_family_name`]).
    pub family: String,
    pub url: String,
    /// Descriptor set passed through to the fetch primitive. Stored sorted by
    /// key so declaration order never changes the identity.
    pub descriptors: BTreeMap<String, String>,
}

impl FontRequest {
    pub fn new(
        family: impl Into<String>,
        url: impl Into<String>,
        descriptors: BTreeMap<String, String>,
    ) -> Self {
        FontRequest {
            family: sanitize_family_name(&family.into()),
            url: url.into(),
            descriptors,
        }
    }

    /// Builds the request from an element's attached metadata.
    ///
    /// Missing family or URL is a hard validation failure. A malformed
    /// descriptor blob is not: it downgrades to an empty descriptor set.
    pub fn from_element(element: &dyn FontElement) -> Result<Self, FontError> {
        let family = element
            .font_family()
            .filter(|f| !f.trim().is_empty())
            .ok_or(FontError::MissingMetadata("font family"))?;
        let url = element
            .font_url()
            .filter(|u| !u.trim().is_empty())
            .ok_or(FontError::MissingMetadata("font url"))?;
        let descriptors = parse_descriptors(element.font_descriptors().as_deref());
        Ok(FontRequest::new(family, url, descriptors))
    }

    /// Canonical identity key: sanitized family, URL, and the descriptor set
    /// serialized in key order.
    pub fn cache_key(&self) -> String {
        let mut key = String::with_capacity(
            self.family.len() + self.url.len() + self.descriptors.len() * 16 + 2,
        );
        key.push_str(&self.family);
        key.push(':');
        key.push_str(&self.url);
        for (name, value) in &self.descriptors {
            key.push(':');
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
        key
    }
}

/// Sanitizes a font family name for registration.
///
/// Whitespace, `+`, `|` and `.` are known to trip font-family parsing on some
/// platforms; they are replaced with `_` after trimming.
pub fn sanitize_family_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_whitespace() || matches!(c, '+' | '|' | '.') {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Parses a serialized descriptor blob into a sorted descriptor set.
///
/// Absent or malformed input yields an empty set; the parse failure is
/// logged, never propagated, so registration continues with defaults.
pub fn parse_descriptors(blob: Option<&str>) -> BTreeMap<String, String> {
    let Some(blob) = blob else {
        return BTreeMap::new();
    };
    if blob.trim().is_empty() {
        return BTreeMap::new();
    }
    match serde_json::from_str::<BTreeMap<String, String>>(blob) {
        Ok(descriptors) => descriptors,
        Err(err) => {
            tracing::warn!(error = %err, "malformed font descriptors, using defaults");
            BTreeMap::new()
        }
    }
}
