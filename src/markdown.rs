use crate::aggregate::Summary;
use crate::pipeline::{ChannelOutcome, ChannelReport};
use crate::report::preview;

fn cell(s: &str) -> String { s.replace('|', "\\|") }

pub fn render_markdown(s: &Summary, hours: u64, channels: &[ChannelReport], dropped: usize) -> String {
    let mut md = String::new();
    md.push_str("# Event Report\n\n");
    md.push_str(&format!("Window: last {}h\n\n", hours));
    md.push_str(&format!("- Total Events: {}\n", s.total));
    md.push_str(&format!("- Errors and Criticals: {}\n", s.errors.len()));
    if dropped > 0 { md.push_str(&format!("- Dropped (unreadable): {}\n", dropped)); }
    md.push('\n');

    md.push_str("## Levels\n");
    if s.levels.is_empty() { md.push_str("None\n"); } else { for (l, c) in &s.levels { md.push_str(&format!("- {} ({})\n", l, c)); } }
    md.push('\n');

    md.push_str("## Top Sources\n");
    if s.top_sources.is_empty() { md.push_str("None\n"); } else { for (p, c) in &s.top_sources { md.push_str(&format!("- {} ({})\n", p, c)); } }
    md.push('\n');

    md.push_str("## Top Event IDs\n");
    if s.top_event_ids.is_empty() { md.push_str("None\n"); } else { for (id, c) in &s.top_event_ids { md.push_str(&format!("- {} ({})\n", id, c)); } }
    md.push('\n');

    md.push_str("## Errors\n");
    if s.errors.is_empty() {
        md.push_str("None\n\n");
    } else {
        md.push_str("| Time | Level | Source | EventID | Message |\n|---|---|---|---|---|\n");
        for r in &s.errors {
            md.push_str(&format!("| {} | {} | {} | {} | {} |\n", r.timestamp.format("%Y-%m-%d %H:%M:%S"), r.level, cell(&r.source), r.event_id, cell(&preview(&r.message))));
        }
        md.push('\n');
    }

    md.push_str("## Channels\n");
    for c in channels {
        let state = match &c.outcome {
            ChannelOutcome::Exhausted => "complete".to_string(),
            ChannelOutcome::OpenFailed(e) => format!("not opened ({})", e),
            ChannelOutcome::PageFailed(e) => format!("stopped early ({})", e),
            ChannelOutcome::Truncated => "truncated".to_string(),
            ChannelOutcome::Skipped => "skipped".to_string(),
        };
        md.push_str(&format!("- {}: {} records, {}\n", c.channel, c.retained, state));
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{DEFAULT_TOP, rec, summarize};
    use crate::record::Level;

    #[test]
    fn sections_and_escaping() {
        let mut e = rec(Level::Error, "Vendor|Agent", 9);
        e.message = "a | b".to_string();
        let s = summarize(&[rec(Level::Info, "EventLog", 6005), e], DEFAULT_TOP);
        let channels = vec![ChannelReport { channel: "System".to_string(), retained: 2, outcome: ChannelOutcome::Truncated }];
        let md = render_markdown(&s, 6, &channels, 1);
        assert!(md.starts_with("# Event Report\n\nWindow: last 6h"));
        assert!(md.contains("- Total Events: 2\n"));
        assert!(md.contains("- Dropped (unreadable): 1\n"));
        assert!(md.contains("| Vendor\\|Agent | 9 | a \\| b |"));
        assert!(md.contains("- System: 2 records, truncated"));
    }

    #[test]
    fn empty_summary() {
        let md = render_markdown(&summarize(&[], DEFAULT_TOP), 1, &[], 0);
        assert!(md.contains("## Errors\nNone"));
        assert!(!md.contains("Dropped"));
    }
}
