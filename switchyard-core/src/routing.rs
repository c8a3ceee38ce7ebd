//! Binding-pattern matching for the three exchange kinds.
//!
//! Direct exchanges compare the binding pattern and routing key byte-exactly.
//! Fanout exchanges ignore the routing key entirely. Topic exchanges split
//! both pattern and key on `.` and compare segment-wise, where a pattern
//! segment is a literal word, `*` (exactly one segment), or `#` (zero or more
//! segments). `#` only has wildcard meaning as a whole segment.
//!
//! Topic matching requires backtracking: `a.#.c` must match `a.b.b.c`, which
//! means a mid-pattern `#` cannot greedily swallow the longest suffix — it has
//! to try every split until the remainder of the pattern matches the
//! remainder of the key.

use crate::topology::ExchangeKind;

/// Returns true if a binding with `pattern` on an exchange of `kind` matches
/// `routing_key`.
pub fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
    }
}

/// Anchored segment-wise topic match.
///
/// An empty routing key has zero segments, so it is matched by `#` (and by an
/// empty pattern) but not by `*`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = segments(pattern);
    let key: Vec<&str> = segments(routing_key);
    match_segments(&pattern, &key)
}

fn segments(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // Try every possible number of consumed key segments, shortest
            // first. Consecutive `#` segments collapse naturally here.
            (0..=key.len()).any(|n| match_segments(rest, &key[n..]))
        }
        Some((seg, rest)) => match key.split_first() {
            Some((word, key_rest)) => {
                (*seg == "*" || seg == word) && match_segments(rest, key_rest)
            }
            None => false,
        },
    }
}
