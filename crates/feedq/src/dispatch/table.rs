// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The pattern/action table.
//!
//! One rule per line:
//!
//! ```text
//! # feedtype   pattern          action  args...
//! SATELLITE    ^GOES(\d+)       FILE    /data/goes/goes$1.dat
//! TEXT|RADAR   ^(\w+)           PIPE    /usr/local/bin/archive -t $1
//! ANY          .*               EXEC    /usr/local/bin/notify $ident
//! ```
//!
//! Fields are whitespace-separated; the pattern must not contain spaces
//! (use `\s` classes). Every line is validated at load, and a reload that
//! fails leaves the previous table in place.

use super::action::Action;
use crate::product::{Feedtype, ProductInfo};
use regex::Regex;
use std::fmt;
use std::path::Path;

/// One validated rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub feedtype: Feedtype,
    pub pattern: Regex,
    pub action: Action,
    /// 1-based source line, for diagnostics.
    pub line: usize,
}

/// Table load failure: every bad line, reported together.
#[derive(Debug)]
pub struct TableError {
    pub errors: Vec<(usize, String)>,
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} invalid rule(s):", self.errors.len())?;
        for (line, reason) in &self.errors {
            writeln!(f, "  line {line}: {reason}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TableError {}

/// The loaded action table.
#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    pub rules: Vec<Rule>,
}

impl ActionTable {
    /// Parse a table from text.
    pub fn parse(text: &str) -> Result<ActionTable, TableError> {
        let mut rules = Vec::new();
        let mut errors = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(feed), Some(pattern), Some(kind)) =
                (fields.next(), fields.next(), fields.next())
            else {
                errors.push((line_no, "expected: feedtype pattern action args".to_string()));
                continue;
            };
            let args: Vec<&str> = fields.collect();

            let feedtype = match feed.parse::<Feedtype>() {
                Ok(ft) => ft,
                Err(e) => {
                    errors.push((line_no, e));
                    continue;
                }
            };
            let pattern = match Regex::new(pattern) {
                Ok(re) => re,
                Err(e) => {
                    errors.push((line_no, format!("bad pattern: {e}")));
                    continue;
                }
            };
            let action = match Action::parse(kind, &args) {
                Ok(a) => a,
                Err(e) => {
                    errors.push((line_no, e));
                    continue;
                }
            };
            rules.push(Rule {
                feedtype,
                pattern,
                action,
                line: line_no,
            });
        }

        if errors.is_empty() {
            Ok(ActionTable { rules })
        } else {
            Err(TableError { errors })
        }
    }

    /// Load and validate a table file.
    pub fn load(path: &Path) -> Result<ActionTable, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::parse(&text).map_err(|e| e.to_string())
    }

    /// The feed union across rules, for the dispatcher's queue class.
    #[must_use]
    pub fn feed_union(&self) -> Feedtype {
        self.rules
            .iter()
            .fold(Feedtype::NONE, |acc, r| acc | r.feedtype)
    }

    /// Run every matching rule over a product; returns how many matched.
    pub fn dispatch(&self, info: &ProductInfo, data: &[u8]) -> usize {
        let mut matched = 0;
        for rule in &self.rules {
            if !rule.feedtype.intersects(info.feedtype) {
                continue;
            }
            let Some(captures) = rule.pattern.captures(&info.ident) else {
                continue;
            };
            matched += 1;
            if let Err(e) = rule.action.execute(info, data, &captures) {
                log::warn!(
                    "rule at line {} failed for {}: {e}",
                    rule.line,
                    info.ident
                );
            }
        }
        matched
    }
}
