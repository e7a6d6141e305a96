//! Identifier generation for new records.
//!
//! Ids are derived from the local working copy only, so they are known
//! before the remote insert is dispatched and never depend on its outcome.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::models::Collection;

/// How a collection names its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdScheme {
    /// Human-facing: prefix plus a zero-padded counter, e.g. `ST07`.
    Sequential { prefix: &'static str, width: usize },
    /// High write frequency: prefix plus epoch milliseconds, e.g. `FEE1725148800000`.
    Timestamp { prefix: &'static str },
}

pub fn scheme_for(collection: Collection) -> IdScheme {
    match collection {
        Collection::Students => IdScheme::Sequential {
            prefix: "ST",
            width: 2,
        },
        Collection::Employees => IdScheme::Sequential {
            prefix: "EMP",
            width: 2,
        },
        Collection::Fees => IdScheme::Timestamp { prefix: "FEE" },
        Collection::Expenses => IdScheme::Timestamp { prefix: "EXP" },
    }
}

/// Next free id for `collection` given every existing id, soft-deleted included.
pub fn next_id<S: AsRef<str>>(collection: Collection, existing: &[S], now: DateTime<Utc>) -> String {
    let taken: HashSet<&str> = existing.iter().map(|s| s.as_ref()).collect();
    match scheme_for(collection) {
        IdScheme::Sequential { prefix, width } => {
            let next = existing
                .iter()
                .filter_map(|id| numeric_suffix(id.as_ref()))
                .max()
                .map_or(1, |max| max + 1);
            let mut candidate = next;
            loop {
                let id = format!("{prefix}{candidate:0width$}");
                if !taken.contains(id.as_str()) {
                    return id;
                }
                candidate += 1;
            }
        }
        IdScheme::Timestamp { prefix } => {
            let mut candidate = now.timestamp_millis().max(0) as u64;
            loop {
                let id = format!("{prefix}{candidate}");
                if !taken.contains(id.as_str()) {
                    return id;
                }
                candidate += 1;
            }
        }
    }
}

/// Trailing run of ASCII digits, if any.
fn numeric_suffix(id: &str) -> Option<u64> {
    let digits = id.len() - id.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    id[id.len() - digits..].parse().ok()
}
