use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use anyhow::Context;
use chrono::{DateTime, Local};
use comfy_table::{ContentArrangement, Table};
use crate::aggregate::Summary;
use crate::paint;
use crate::pipeline::{ChannelOutcome, ChannelReport, DroppedEvent};
use crate::record::EventRecord;

pub const PREVIEW_CHARS: usize = 80;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextFormat { #[default] Lines, Table }

pub fn report_file_name(hours: u64, now: DateTime<Local>) -> String {
    format!("event_report_last{}h_{}.jsonl", hours, now.format("%H%M%S"))
}

/// `explicit` wins; otherwise the generated name inside `out_dir`.
pub fn report_path(explicit: Option<&Path>, out_dir: &Path, hours: u64, now: DateTime<Local>) -> PathBuf {
    match explicit {
        Some(p) => p.to_path_buf(),
        None => out_dir.join(report_file_name(hours, now)),
    }
}

/// First `n` characters, with `...` appended when anything was cut.
pub fn truncate(s: &str, n: usize) -> String {
    let mut out: String = s.chars().take(n).collect();
    if s.chars().count() > n { out.push_str("..."); }
    out
}

/// Single-line message preview for the error listing.
pub fn preview(message: &str) -> String {
    let flat: String = message.chars().map(|c| if c == '\r' || c == '\n' { ' ' } else { c }).collect();
    truncate(&flat, PREVIEW_CHARS)
}

fn stamp(r: &EventRecord) -> String { r.timestamp.format("%Y-%m-%d %H:%M:%S").to_string() }

/// One JSON object per line, every record, in retrieval order.
pub fn write_jsonl(path: &Path, records: &[EventRecord]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() && !dir.as_os_str().is_empty() && !dir.exists() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for r in records {
        serde_json::to_writer(&mut w, r).with_context(|| format!("writing {}", path.display()))?;
        w.write_all(b"\n")?;
    }
    w.flush().with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub fn write_csv(path: &Path, records: &[EventRecord]) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    wtr.write_record(["timestamp", "level", "source", "event_id", "raw_level", "message"])?;
    for r in records {
        wtr.write_record([r.timestamp.to_rfc3339(), r.level.to_string(), r.source.clone(), r.event_id.to_string(), r.raw_level.to_string(), r.message.clone()])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn render_summary(out: &mut impl Write, s: &Summary, hours: u64, format: TextFormat) -> io::Result<()> {
    let rule = "=".repeat(60);
    writeln!(out)?;
    writeln!(out, "{}", rule)?;
    writeln!(out, "{}", paint(&format!("Events in the last {}h ({} total)", hours, s.total), "1;36"))?;
    writeln!(out, "{}", rule)?;
    match format {
        TextFormat::Lines => render_lines(out, s),
        TextFormat::Table => render_tables(out, s),
    }
}

fn render_lines(out: &mut impl Write, s: &Summary) -> io::Result<()> {
    writeln!(out, "\n{}", paint("[Levels]", "1"))?;
    for (l, c) in &s.levels { writeln!(out, "{}: {}", paint(&l.to_string(), l.color_code()), c)?; }
    writeln!(out, "\n{}", paint(&format!("[Top {} sources]", s.top_sources.len()), "1"))?;
    for (p, c) in &s.top_sources { writeln!(out, "{}: {}", p, c)?; }
    writeln!(out, "\n{}", paint(&format!("[Top {} event IDs]", s.top_event_ids.len()), "1"))?;
    for (id, c) in &s.top_event_ids { writeln!(out, "{}: {}", id, c)?; }
    writeln!(out, "\n{}", paint("[Errors]", "1"))?;
    if s.errors.is_empty() { writeln!(out, "{}", paint("No errors", "1;32"))?; }
    for r in &s.errors {
        writeln!(out, "{} | {} | EventID:{} | {}", stamp(r), r.source, r.event_id, preview(&r.message))?;
    }
    Ok(())
}

fn table(header: &[&str]) -> Table {
    let mut t = Table::new();
    t.set_content_arrangement(ContentArrangement::Dynamic);
    t.set_header(header.iter().map(|h| paint(h, "1")).collect::<Vec<_>>());
    t
}

fn render_tables(out: &mut impl Write, s: &Summary) -> io::Result<()> {
    let mut levels = table(&["Level", "Count"]);
    for (l, c) in &s.levels { levels.add_row(vec![paint(&l.to_string(), l.color_code()), c.to_string()]); }
    writeln!(out, "{}", levels)?;
    let mut sources = table(&["Source", "Count"]);
    for (p, c) in &s.top_sources { sources.add_row(vec![p.clone(), c.to_string()]); }
    writeln!(out, "{}", sources)?;
    let mut ids = table(&["EventID", "Count"]);
    for (id, c) in &s.top_event_ids { ids.add_row(vec![id.to_string(), c.to_string()]); }
    writeln!(out, "{}", ids)?;
    if s.errors.is_empty() { return writeln!(out, "{}", paint("No errors", "1;32")); }
    let mut errors = table(&["Time", "Level", "Source", "EventID", "Message"]);
    for r in &s.errors {
        errors.add_row(vec![stamp(r), paint(&r.level.to_string(), r.level.color_code()), r.source.clone(), r.event_id.to_string(), preview(&r.message)]);
    }
    writeln!(out, "{}", errors)
}

fn outcome_text(o: &ChannelOutcome) -> String {
    match o {
        ChannelOutcome::Exhausted => "complete".to_string(),
        ChannelOutcome::OpenFailed(e) => format!("not opened: {}", e),
        ChannelOutcome::PageFailed(e) => format!("stopped early: {}", e),
        ChannelOutcome::Truncated => "truncated at the record ceiling".to_string(),
        ChannelOutcome::Skipped => "skipped (record ceiling reached)".to_string(),
    }
}

/// Per-channel retrieval lines and the dropped-record count.
pub fn render_footer(out: &mut impl Write, channels: &[ChannelReport], dropped: &[DroppedEvent]) -> io::Result<()> {
    writeln!(out, "\n{}", paint("[Channels]", "1"))?;
    for c in channels {
        let code = match c.outcome { ChannelOutcome::Exhausted => "32", ChannelOutcome::Truncated | ChannelOutcome::Skipped => "33", _ => "31" };
        let lost = dropped.iter().filter(|d| d.channel == c.channel).count();
        let lost = if lost > 0 { format!(" ({} dropped)", lost) } else { String::new() };
        writeln!(out, "{}: {} records, {}{}", c.channel, c.retained, paint(&outcome_text(&c.outcome), code), lost)?;
    }
    if !dropped.is_empty() { writeln!(out, "{} unreadable events dropped (use -v for details)", dropped.len())?; }
    Ok(())
}
