use std::collections::HashMap;
use std::hash::Hash;
use crate::record::{EventRecord, Level};

pub const DEFAULT_TOP: usize = 10;

#[derive(Clone, Debug)]
pub struct Summary {
    pub total: usize,
    /// Count per level, in the order each level first appeared.
    pub levels: Vec<(Level, usize)>,
    pub top_sources: Vec<(String, usize)>,
    pub top_event_ids: Vec<(u32, usize)>,
    /// Error and Critical records, in retrieval order.
    pub errors: Vec<EventRecord>,
}

/// Counts per key in first-seen order.
pub fn tally<K: Eq + Hash + Clone>(keys: impl IntoIterator<Item = K>) -> Vec<(K, usize)> {
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut out: Vec<(K, usize)> = Vec::new();
    for k in keys {
        match index.get(&k) {
            Some(&i) => out[i].1 += 1,
            None => { index.insert(k.clone(), out.len()); out.push((k, 1)); }
        }
    }
    out
}

/// Highest counts first; equal counts keep first-seen order (the sort is stable).
pub fn top_n<K: Eq + Hash + Clone>(keys: impl IntoIterator<Item = K>, n: usize) -> Vec<(K, usize)> {
    let mut v = tally(keys);
    v.sort_by(|a, b| b.1.cmp(&a.1));
    v.truncate(n);
    v
}

pub fn summarize(records: &[EventRecord], top: usize) -> Summary {
    Summary {
        total: records.len(),
        levels: tally(records.iter().map(|r| r.level)),
        top_sources: top_n(records.iter().map(|r| r.source.clone()), top),
        top_event_ids: top_n(records.iter().map(|r| r.event_id), top),
        errors: records.iter().filter(|r| r.level.is_error()).cloned().collect(),
    }
}

#[cfg(test)]
pub(crate) fn rec(level: Level, source: &str, event_id: u32) -> EventRecord {
    use chrono::TimeZone;
    let ts = chrono::FixedOffset::east_opt(0).and_then(|o| o.with_ymd_and_hms(2025, 11, 30, 12, 0, 0).single()).unwrap();
    let raw_level = match level {
        Level::LogAlways => 0, Level::Critical => 1, Level::Error => 2, Level::Warning => 3,
        Level::Info => 4, Level::Verbose => 5, Level::Other(n) => n,
    };
    EventRecord { timestamp: ts, level, source: source.to_string(), event_id, raw_level, message: String::new() }
}
