// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Product classes: the matching predicate readers sequence with.
//!
//! A class is a time window plus one or more `(feedtype mask, identity
//! regex)` specs. A product matches the class iff its insertion time lies in
//! the window and at least one spec matches both its feedtype and identity.

use super::{Feedtype, Timestamp};
use regex::Regex;

/// Longest identity pattern accepted before the vetting policy kicks in.
const MAX_PATTERN_LEN: usize = 512;

/// One `(feedtype, pattern)` alternative inside a class.
#[derive(Debug, Clone)]
pub struct PatternSpec {
    pub feedtype: Feedtype,
    pub pattern: String,
    regex: Regex,
}

impl PatternSpec {
    /// Compile a spec, applying the pathological-pattern policy: a pattern
    /// that fails vetting or compilation is logged and replaced by the
    /// match-all pattern rather than rejected.
    pub fn new(feedtype: Feedtype, pattern: &str) -> Result<Self, String> {
        let vetted = vet_pattern(pattern);
        let regex = Regex::new(vetted).map_err(|e| format!("bad pattern {pattern:?}: {e}"))?;
        Ok(PatternSpec {
            feedtype,
            pattern: vetted.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn matches(&self, feedtype: Feedtype, ident: &str) -> bool {
        self.feedtype.intersects(feedtype) && self.regex.is_match(ident)
    }
}

/// Vet an identity pattern before compiling it.
///
/// The regex engine is linear-time, so the vet guards against pattern-size
/// blowup rather than backtracking: oversized patterns and deeply nested
/// unbounded repetitions are replaced with the match-all pattern.
fn vet_pattern(pattern: &str) -> &str {
    if pattern.len() > MAX_PATTERN_LEN {
        log::warn!(
            "identity pattern of {} bytes exceeds {} byte limit, using \".*\"",
            pattern.len(),
            MAX_PATTERN_LEN
        );
        return ".*";
    }
    if has_nested_unbounded_repetition(pattern) {
        log::warn!("identity pattern {pattern:?} nests unbounded repetition, using \".*\"");
        return ".*";
    }
    pattern
}

/// Detect `(...+)+` / `(...*)*` shapes: an unbounded repetition applied to a
/// group that itself contains an unbounded repetition.
fn has_nested_unbounded_repetition(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut depth_has_rep = vec![false];
    let mut prev_escape = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if prev_escape {
            prev_escape = false;
            i += 1;
            continue;
        }
        match c {
            b'\\' => prev_escape = true,
            b'(' => depth_has_rep.push(false),
            b')' => {
                let inner = depth_has_rep.pop().unwrap_or(false);
                // Repetition applied to this closing group?
                let rep_follows = matches!(bytes.get(i + 1), Some(b'*' | b'+'));
                if inner && rep_follows {
                    return true;
                }
                if let Some(top) = depth_has_rep.last_mut() {
                    *top |= inner || rep_follows;
                }
            }
            b'*' | b'+' => {
                if let Some(top) = depth_has_rep.last_mut() {
                    *top = true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

/// Time window plus OR'd pattern specs.
#[derive(Debug, Clone)]
pub struct ProductClass {
    /// Earliest matching insertion time (inclusive).
    pub from: Timestamp,
    /// Latest matching insertion time (inclusive).
    pub to: Timestamp,
    pub specs: Vec<PatternSpec>,
}

impl ProductClass {
    /// The everything-class: all time, all feeds, all identities.
    pub fn everything() -> Self {
        ProductClass {
            from: Timestamp::ZERO,
            to: Timestamp::MAX,
            specs: vec![
                PatternSpec::new(Feedtype::ANY, ".*").expect("match-all pattern compiles"),
            ],
        }
    }

    /// Build a single-spec class over all time.
    pub fn of(feedtype: Feedtype, pattern: &str) -> Result<Self, String> {
        Ok(ProductClass {
            from: Timestamp::ZERO,
            to: Timestamp::MAX,
            specs: vec![PatternSpec::new(feedtype, pattern)?],
        })
    }

    /// Does `time` fall inside the class window?
    #[must_use]
    pub fn time_matches(&self, time: Timestamp) -> bool {
        self.from <= time && time <= self.to
    }

    /// Full match: window, feedtype, and identity.
    #[must_use]
    pub fn matches(&self, time: Timestamp, feedtype: Feedtype, ident: &str) -> bool {
        self.time_matches(time) && self.meta_matches(feedtype, ident)
    }

    /// Feedtype + identity match, ignoring the time window.
    #[must_use]
    pub fn meta_matches(&self, feedtype: Feedtype, ident: &str) -> bool {
        self.specs.iter().any(|s| s.matches(feedtype, ident))
    }

    /// Union of the feedtype masks across all specs.
    #[must_use]
    pub fn feed_union(&self) -> Feedtype {
        self.specs
            .iter()
            .fold(Feedtype::NONE, |acc, s| acc | s.feedtype)
    }

    /// Intersect this class with an offer: keep only specs whose feedtype
    /// overlaps the offered mask, narrowing each to the overlap.
    #[must_use]
    pub fn intersect_feed(&self, offered: Feedtype) -> ProductClass {
        let specs = self
            .specs
            .iter()
            .filter(|s| s.feedtype.intersects(offered))
            .map(|s| PatternSpec {
                feedtype: s.feedtype & offered,
                pattern: s.pattern.clone(),
                regex: s.regex.clone(),
            })
            .collect();
        ProductClass {
            from: self.from,
            to: self.to,
            specs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_everything_matches_anything() {
        let c = ProductClass::everything();
        assert!(c.matches(Timestamp::now(), Feedtype::RADAR, "NEXRAD3 KTLX"));
        assert!(c.matches(Timestamp::ZERO, Feedtype::TEXT, ""));
    }

    #[test]
    fn test_feedtype_filtering() {
        let c = ProductClass::of(Feedtype::SATELLITE, "^GOES").unwrap();
        let t = Timestamp::now();
        assert!(c.matches(t, Feedtype::SATELLITE, "GOES18 band 2"));
        assert!(!c.matches(t, Feedtype::RADAR, "GOES18 band 2"));
        assert!(!c.matches(t, Feedtype::SATELLITE, "HIMAWARI"));
    }

    #[test]
    fn test_time_window() {
        let mut c = ProductClass::everything();
        c.from = Timestamp { sec: 100, usec: 0 };
        c.to = Timestamp { sec: 200, usec: 0 };
        assert!(!c.time_matches(Timestamp { sec: 99, usec: 999_999 }));
        assert!(c.time_matches(Timestamp { sec: 100, usec: 0 }));
        assert!(c.time_matches(Timestamp { sec: 200, usec: 0 }));
        assert!(!c.time_matches(Timestamp { sec: 200, usec: 1 }));
    }

    #[test]
    fn test_multiple_specs_or() {
        let c = ProductClass {
            from: Timestamp::ZERO,
            to: Timestamp::MAX,
            specs: vec![
                PatternSpec::new(Feedtype::TEXT, "^SA").unwrap(),
                PatternSpec::new(Feedtype::GRID, "^GFS").unwrap(),
            ],
        };
        let t = Timestamp::now();
        assert!(c.matches(t, Feedtype::TEXT, "SAUS44"));
        assert!(c.matches(t, Feedtype::GRID, "GFS 0.25deg"));
        assert!(!c.matches(t, Feedtype::TEXT, "GFS 0.25deg"));
    }

    #[test]
    fn test_oversized_pattern_vetted_to_match_all() {
        let long = "a".repeat(MAX_PATTERN_LEN + 1);
        let spec = PatternSpec::new(Feedtype::ANY, &long).unwrap();
        assert_eq!(spec.pattern, ".*");
        assert!(spec.matches(Feedtype::TEXT, "anything"));
    }

    #[test]
    fn test_nested_repetition_vetted() {
        let spec = PatternSpec::new(Feedtype::ANY, "(a+)+b").unwrap();
        assert_eq!(spec.pattern, ".*");
        // Plain repetition is left alone.
        let ok = PatternSpec::new(Feedtype::ANY, "a+b*").unwrap();
        assert_eq!(ok.pattern, "a+b*");
        // Escaped parens are not groups.
        let esc = PatternSpec::new(Feedtype::ANY, r"\(a+\)+").unwrap();
        assert_eq!(esc.pattern, r"\(a+\)+");
    }

    #[test]
    fn test_intersect_feed() {
        let c = ProductClass {
            from: Timestamp::ZERO,
            to: Timestamp::MAX,
            specs: vec![
                PatternSpec::new(Feedtype::TEXT | Feedtype::GRID, ".*").unwrap(),
                PatternSpec::new(Feedtype::RADAR, ".*").unwrap(),
            ],
        };
        let narrowed = c.intersect_feed(Feedtype::GRID);
        assert_eq!(narrowed.specs.len(), 1);
        assert_eq!(narrowed.specs[0].feedtype, Feedtype::GRID);
    }
}
