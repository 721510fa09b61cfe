//! Feed polling pipeline: fetch, extract, deduplicate.
//!
//! - [`fetcher`] - Concurrent HTTP retrieval of raw feed payloads
//! - [`parser`] - `quick-xml` walk that extracts `<item>` records
//! - [`dedup`] - Filters out items already recorded in a source's cursor
//! - [`cursor`] - Bounded set of recently seen item identifiers
//!
//! # Example
//!
//! ```ignore
//! use crate::feed::{parse, Fetcher};
//!
//! fetcher.fetch(&mut session, None).await;
//! let fresh = parse(&mut session);
//! ```

mod cursor;
mod dedup;
mod fetcher;
mod parser;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use cursor::{Cursor, CursorStore, DEFAULT_CURSOR_CAPACITY};
pub use dedup::parse;
pub use fetcher::{FetchError, FetchOptions, Fetcher, RetryPolicy, USER_AGENT};
pub use parser::{parse_items, ParseError};

/// Raw feed text keyed by source name, as retrieved by one fetch.
pub type RawSnapshot = BTreeMap<String, String>;

/// New items keyed by source name, in feed document order.
pub type ParsedSnapshot = BTreeMap<String, Vec<FeedItem>>;

/// One `<item>` of a feed.
///
/// Every field is the element's text as it appears in the feed, or empty
/// when the element is missing. Nothing is validated or normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub guid: String,
    /// Raw `<pubDate>` text.
    #[serde(rename = "pubDate")]
    pub published_at: String,
    pub description: String,
}

impl FeedItem {
    /// Identifier used for deduplication: the `guid`, else the `link`.
    ///
    /// Returns `None` when both are empty.
    pub fn identity(&self) -> Option<&str> {
        if !self.guid.is_empty() {
            Some(&self.guid)
        } else if !self.link.is_empty() {
            Some(&self.link)
        } else {
            None
        }
    }
}
