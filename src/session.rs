//! Polling session state.
//!
//! A [`Session`] owns everything that survives between the calls of a cycle:
//! the source registry, the opaque destination routing, the per-source
//! cursors and the snapshots of the last fetch and parse. Operations borrow
//! it explicitly, so two cycles can never touch the same session at once,
//! while independent sessions can be polled side by side.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::Config;
use crate::feed::{
    Cursor, CursorStore, FeedItem, FetchError, ParseError, ParsedSnapshot, RawSnapshot,
    DEFAULT_CURSOR_CAPACITY,
};

/// Feed URL per source name. An empty URL disables the source.
pub type SourceRegistry = BTreeMap<String, String>;

/// Caller-owned routing from sources to delivery targets. Never interpreted here.
pub type Destinations = BTreeMap<String, serde_json::Value>;

/// Why a source produced nothing in the last cycle.
#[derive(Debug, Error)]
pub enum SourceFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl SourceFailure {
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }
}

#[derive(Debug)]
pub struct Session {
    pub(crate) sources: SourceRegistry,
    pub(crate) destinations: Destinations,
    pub(crate) cursors: CursorStore,
    pub(crate) cursor_capacity: usize,
    pub(crate) raw: Option<RawSnapshot>,
    pub(crate) parsed: Option<ParsedSnapshot>,
    pub(crate) failures: BTreeMap<String, SourceFailure>,
    pub(crate) unidentified: ParsedSnapshot,
    pub(crate) last_fetch: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(sources: SourceRegistry, destinations: Destinations) -> Self {
        Self {
            sources,
            destinations,
            cursors: CursorStore::new(),
            cursor_capacity: DEFAULT_CURSOR_CAPACITY,
            raw: None,
            parsed: None,
            failures: BTreeMap::new(),
            unidentified: ParsedSnapshot::new(),
            last_fetch: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sources.clone(), config.destinations.clone())
            .with_cursor_capacity(config.cursor_capacity)
    }

    /// Seeds the cursor store, typically from the caller's persisted copy.
    pub fn with_cursors(mut self, cursors: CursorStore) -> Self {
        self.cursors = cursors;
        let capacity = self.cursor_capacity;
        for cursor in self.cursors.values_mut() {
            cursor.set_capacity(capacity);
        }
        self
    }

    /// Sets how many identifiers each cursor remembers, re-capping existing ones.
    pub fn with_cursor_capacity(mut self, capacity: usize) -> Self {
        self.cursor_capacity = capacity.max(1);
        let capacity = self.cursor_capacity;
        for cursor in self.cursors.values_mut() {
            cursor.set_capacity(capacity);
        }
        self
    }

    /// Replaces the source registry and/or destination routing wholesale.
    ///
    /// `None` leaves the corresponding map untouched. Cursors of sources that
    /// disappear from the registry are kept.
    pub fn update(&mut self, sources: Option<SourceRegistry>, destinations: Option<Destinations>) {
        if let Some(sources) = sources {
            tracing::debug!(count = sources.len(), "Source registry replaced");
            self.sources = sources;
        }
        if let Some(destinations) = destinations {
            tracing::debug!(count = destinations.len(), "Destination routing replaced");
            self.destinations = destinations;
        }
    }

    /// Returns the requested projection of the current state.
    pub fn export(&self, options: ExportOptions) -> Export {
        Export {
            data: options
                .data
                .then(|| self.parsed.clone().unwrap_or_default()),
            fetched_at: if options.data { self.last_fetch } else { None },
            sources: options.sources.then(|| self.sources.clone()),
            destinations: options.destinations.then(|| self.destinations.clone()),
            cursors: options.cursors.then(|| self.cursors.clone()),
            failures: options.failures.then(|| {
                self.failures
                    .iter()
                    .map(|(name, failure)| (name.clone(), failure.to_string()))
                    .collect()
            }),
            unidentified: options.failures.then(|| self.unidentified.clone()),
        }
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn cursor(&self, source: &str) -> Option<&Cursor> {
        self.cursors.get(source)
    }

    pub fn cursor_capacity(&self) -> usize {
        self.cursor_capacity
    }

    /// Hands the cursor store back to the caller for persistence.
    pub fn into_cursors(self) -> CursorStore {
        self.cursors
    }

    /// Raw payloads of the last fetch, if any fetch happened.
    pub fn raw(&self) -> Option<&RawSnapshot> {
        self.raw.as_ref()
    }

    /// New items of the last parse, if any parse happened.
    pub fn parsed(&self) -> Option<&ParsedSnapshot> {
        self.parsed.as_ref()
    }

    /// Per-source failures of the last fetch and parse.
    pub fn failures(&self) -> &BTreeMap<String, SourceFailure> {
        &self.failures
    }

    /// Items of the last parse that had neither guid nor link, per source.
    pub fn unidentified(&self) -> &ParsedSnapshot {
        &self.unidentified
    }

    pub fn last_fetch(&self) -> Option<DateTime<Utc>> {
        self.last_fetch
    }

    pub(crate) fn finish_fetch(
        &mut self,
        snapshot: RawSnapshot,
        failures: BTreeMap<String, SourceFailure>,
    ) -> &RawSnapshot {
        self.failures = failures;
        self.last_fetch = Some(Utc::now());
        self.raw.insert(snapshot)
    }
}

/// Selects which parts of the state [`Session::export`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    pub data: bool,
    pub sources: bool,
    pub destinations: bool,
    pub cursors: bool,
    pub failures: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            data: true,
            sources: false,
            destinations: false,
            cursors: false,
            failures: false,
        }
    }
}

impl ExportOptions {
    pub fn all() -> Self {
        Self {
            data: true,
            sources: true,
            destinations: true,
            cursors: true,
            failures: true,
        }
    }
}

/// Plain snapshot of session state. Unrequested parts are `None` and are
/// left out when serialized.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Export {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ParsedSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<SourceRegistry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Destinations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursors: Option<CursorStore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures: Option<BTreeMap<String, String>>,
    /// Items left out of `data` because they had no guid or link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unidentified: Option<ParsedSnapshot>,
}
