use std::collections::BTreeMap;

use super::parser::parse_items;
use super::{Cursor, FeedItem, ParsedSnapshot};
use crate::session::{Session, SourceFailure};

/// Parses the session's last raw snapshot and keeps only unseen items.
///
/// For every source in the snapshot the cursor is created if missing, the
/// payload is parsed, and items are walked in document order: an item whose
/// identity is already in the cursor is dropped (and refreshed in the
/// cursor), any other item is emitted and recorded. Afterwards the cursor's
/// [`last`](Cursor::last) is the identity of the last item walked.
///
/// # Returns
///
/// `None` when no fetch has happened yet or the last fetch produced no
/// payloads. Otherwise the new items per source; a source whose payload is
/// malformed is left out and its error recorded in the session's failures.
/// Items with neither guid nor link cannot be deduplicated; they are left out
/// of the result and kept in [`Session::unidentified`] instead.
pub fn parse(session: &mut Session) -> Option<&ParsedSnapshot> {
    let raw = match session.raw.as_ref() {
        Some(raw) if !raw.is_empty() => raw,
        _ => {
            tracing::debug!("No raw payloads to parse");
            return None;
        }
    };

    let capacity = session.cursor_capacity;
    let mut parsed = ParsedSnapshot::new();
    let mut failures = BTreeMap::new();
    let mut unidentified = BTreeMap::new();

    for (name, payload) in raw {
        let cursor = session
            .cursors
            .entry(name.clone())
            .or_insert_with(|| Cursor::with_capacity(capacity));

        match parse_items(payload) {
            Ok(items) => {
                let total = items.len();
                let (fresh, dropped) = retain_unseen(name, cursor, items);
                tracing::debug!(
                    source = %name,
                    total = total,
                    new = fresh.len(),
                    unidentified = dropped.len(),
                    cursor = %cursor.last(),
                    "Feed parsed"
                );
                parsed.insert(name.clone(), fresh);
                if !dropped.is_empty() {
                    unidentified.insert(name.clone(), dropped);
                }
            }
            Err(e) => {
                tracing::warn!(source = %name, error = %e, "Malformed feed, skipping source");
                failures.insert(name.clone(), SourceFailure::Parse(e));
            }
        }
    }

    session.failures.retain(|_, failure| !failure.is_parse());
    session.failures.extend(failures);
    session.unidentified = unidentified;

    Some(&*session.parsed.insert(parsed))
}

/// Splits `items` into those not in `cursor` and those with no identity at
/// all, recording every identity walked.
fn retain_unseen(
    source: &str,
    cursor: &mut Cursor,
    items: Vec<FeedItem>,
) -> (Vec<FeedItem>, Vec<FeedItem>) {
    let mut fresh = Vec::new();
    let mut dropped = Vec::new();

    for item in items {
        let Some(id) = item.identity() else {
            tracing::warn!(source = %source, title = %item.title, "Item has neither guid nor link, dropping");
            dropped.push(item);
            continue;
        };

        if cursor.contains(id) {
            cursor.record(id);
            continue;
        }

        cursor.record(id);
        fresh.push(item);
    }

    (fresh, dropped)
}
