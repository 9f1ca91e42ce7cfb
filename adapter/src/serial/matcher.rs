//! Inbound line dispatch.
//!
//! The [`LineMatcher`] owns a mapping from compiled patterns to ordered
//! handler lists. Every inbound line is tested against every pattern; for
//! each match, all attached handlers fire synchronously with the match
//! object. Handlers for a single pattern fire in registration order; there
//! is no ordering between different patterns. Handlers must not block —
//! they run on the serial pump task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use regex::{Captures, Regex};
use tracing::trace;

/// Handler invoked with the match object of its pattern.
pub type LineHandler = Arc<dyn Fn(&Captures<'_>) + Send + Sync>;

/// Identity of one registered handler, needed to remove it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchToken {
    pattern: &'static str,
    id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("no handler registered under the given token for pattern {0:?}")]
    UnknownHandler(String),
}

struct PatternEntry {
    pattern: &'static Regex,
    handlers: Vec<(u64, LineHandler)>,
}

/// Pattern to handler registry over the inbound serial line.
pub struct LineMatcher {
    entries: Mutex<Vec<PatternEntry>>,
    next_id: AtomicU64,
}

impl LineMatcher {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Appends a handler to the given pattern's list.
    pub fn add_handler(
        &self,
        pattern: &'static Regex,
        handler: impl Fn(&Captures<'_>) + Send + Sync + 'static,
    ) -> MatchToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().expect("matcher registry poisoned");

        let entry = entries
            .iter_mut()
            .find(|entry| std::ptr::eq(entry.pattern, pattern));
        match entry {
            Some(entry) => entry.handlers.push((id, Arc::new(handler))),
            None => entries.push(PatternEntry {
                pattern,
                handlers: vec![(id, Arc::new(handler))],
            }),
        }

        MatchToken {
            pattern: pattern.as_str(),
            id,
        }
    }

    /// Removes the handler registered under `token`.
    pub fn remove_handler(&self, token: &MatchToken) -> Result<(), MatcherError> {
        let mut entries = self.entries.lock().expect("matcher registry poisoned");
        for entry in entries.iter_mut() {
            if entry.pattern.as_str() != token.pattern {
                continue;
            }
            let before = entry.handlers.len();
            entry.handlers.retain(|(id, _)| *id != token.id);
            if entry.handlers.len() != before {
                return Ok(());
            }
        }
        Err(MatcherError::UnknownHandler(token.pattern.to_string()))
    }

    /// Tests one inbound line against every pattern and fires the handlers
    /// of each match.
    pub fn feed(&self, line: &str) {
        // Snapshot so handlers may register or remove handlers re-entrantly.
        let snapshot: Vec<(&'static Regex, Vec<LineHandler>)> = {
            let entries = self.entries.lock().expect("matcher registry poisoned");
            entries
                .iter()
                .map(|entry| {
                    (
                        entry.pattern,
                        entry
                            .handlers
                            .iter()
                            .map(|(_, handler)| Arc::clone(handler))
                            .collect(),
                    )
                })
                .collect()
        };

        for (pattern, handlers) in snapshot {
            if let Some(captures) = pattern.captures(line) {
                trace!(pattern = pattern.as_str(), line, "serial line matched");
                for handler in handlers {
                    handler(&captures);
                }
            }
        }
    }
}

impl Default for LineMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::atomic::AtomicUsize;

    static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^hello (?P<name>\w+)$").unwrap());
    static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

    #[test]
    fn test_handlers_fire_in_registration_order_per_pattern() {
        let matcher = LineMatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let seen = Arc::clone(&seen);
            matcher.add_handler(&WORD, move |caps| {
                seen.lock().unwrap().push((id, caps["name"].to_string()));
            });
        }

        matcher.feed("hello world");
        matcher.feed("12"); // no handlers, must be a no-op
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (0, "world".to_string()),
                (1, "world".to_string()),
                (2, "world".to_string())
            ]
        );
    }

    #[test]
    fn test_remove_handler() {
        let matcher = LineMatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&hits);
        let token = matcher.add_handler(&DIGITS, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        matcher.feed("42");
        matcher.remove_handler(&token).unwrap();
        matcher.feed("42");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matcher.remove_handler(&token).is_err());
    }

    #[test]
    fn test_multiple_patterns_can_match_one_line() {
        let matcher = LineMatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        static ANY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^.*$").unwrap());
        for pattern in [&*DIGITS, &*ANY] {
            let counted = Arc::clone(&hits);
            matcher.add_handler(pattern, move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            });
        }

        matcher.feed("1234");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
