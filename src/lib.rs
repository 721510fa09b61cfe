//! Feed-to-notification bridging core.
//!
//! `feedrelay` polls RSS feeds and hands back only the items that were not
//! seen in an earlier cycle. A cycle is two calls against an explicit
//! [`Session`]:
//!
//! ```no_run
//! use feedrelay::{feed, Fetcher, FetchOptions, Session};
//! use std::collections::BTreeMap;
//!
//! # async fn cycle() -> Result<(), feedrelay::FetchError> {
//! let sources = BTreeMap::from([("hn".to_string(), "https://news.ycombinator.com/rss".to_string())]);
//! let mut session = Session::new(sources, BTreeMap::new());
//! let fetcher = Fetcher::new(FetchOptions::default())?;
//!
//! fetcher.fetch(&mut session, None).await;
//! if let Some(fresh) = feed::parse(&mut session) {
//!     for (source, items) in fresh {
//!         println!("{source}: {} new", items.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Scheduling, delivery and persistence of the cursor store belong to the
//! caller; see the `feedrelay` binary for one way of wiring them.

pub mod config;
pub mod feed;
pub mod session;

pub use config::{Config, ConfigError};
pub use feed::{
    Cursor, CursorStore, FeedItem, FetchError, FetchOptions, Fetcher, ParseError,
    ParsedSnapshot, RawSnapshot, RetryPolicy,
};
pub use session::{
    Destinations, Export, ExportOptions, Session, SourceFailure, SourceRegistry,
};
