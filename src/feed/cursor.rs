use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Number of identifiers a cursor remembers unless configured otherwise.
pub const DEFAULT_CURSOR_CAPACITY: usize = 256;

/// Cursors keyed by source name.
pub type CursorStore = BTreeMap<String, Cursor>;

/// Bounded set of the identifiers most recently seen for one source.
///
/// Entries are kept in recording order. Recording an identifier that is
/// already present moves it to the newest position, so identifiers that keep
/// appearing in a feed are never evicted while the feed fits in the capacity.
///
/// Serializes as an array ordered oldest to newest. Deserializes from that
/// array or from a single string, the shape used by stores that only kept
/// the last seen identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CursorRepr", into = "Vec<String>")]
pub struct Cursor {
    order: VecDeque<String>,
    index: HashSet<String>,
    capacity: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CursorRepr {
    Last(String),
    Seen(Vec<String>),
}

impl From<CursorRepr> for Cursor {
    fn from(repr: CursorRepr) -> Self {
        match repr {
            CursorRepr::Last(last) => Cursor::from_last(last),
            CursorRepr::Seen(seen) => {
                let capacity = seen.len().max(DEFAULT_CURSOR_CAPACITY);
                let mut cursor = Cursor::with_capacity(capacity);
                for id in seen.into_iter().filter(|id| !id.is_empty()) {
                    cursor.record(id);
                }
                cursor
            }
        }
    }
}

impl From<Cursor> for Vec<String> {
    fn from(cursor: Cursor) -> Self {
        cursor.order.into_iter().collect()
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CURSOR_CAPACITY)
    }
}

impl Cursor {
    /// Creates an empty cursor holding at most `capacity` identifiers (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            index: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Seeds a cursor from a single last-seen identifier. Empty means nothing seen.
    pub fn from_last(last: impl Into<String>) -> Self {
        let mut cursor = Self::default();
        let last = last.into();
        if !last.is_empty() {
            cursor.record(last);
        }
        cursor
    }

    /// Exact-match membership test.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Records `id` as the most recently seen identifier, evicting the
    /// least recently recorded ones beyond capacity.
    pub fn record(&mut self, id: impl Into<String>) {
        let id = id.into();
        if self.index.contains(&id) {
            if let Some(pos) = self.order.iter().position(|seen| *seen == id) {
                self.order.remove(pos);
            }
        } else {
            self.index.insert(id.clone());
        }
        self.order.push_back(id);
        self.evict();
    }

    /// The most recently recorded identifier, or `""` when nothing was seen.
    pub fn last(&self) -> &str {
        self.order.back().map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the capacity, dropping the oldest entries if it shrinks.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict();
    }

    /// Identifiers ordered oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    fn evict(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
            }
        }
    }
}
