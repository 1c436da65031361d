use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use anyhow::Context;
use chrono::Local;
use clap::{ArgAction, ColorChoice, CommandFactory, Parser, ValueEnum};
use clap::builder::TypedValueParser;
use clap_complete::Shell;
use is_terminal::IsTerminal;
use serde::{Deserialize, Serialize};
mod aggregate;
mod decoder;
mod event_xml;
mod evtx_source;
mod markdown;
mod parser;
mod pipeline;
mod record;
mod report;
mod resolver;
mod source;
#[cfg(windows)]
mod windows_live;

use crate::decoder::DecoderFormatter;
use crate::evtx_source::EvtxFileSource;
use crate::pipeline::{Notice, RetrievalOptions, retrieve};
use crate::report::TextFormat;
use crate::resolver::{MessageFormatter, MessageResolver};
use crate::source::{EventSource, Window};

static ENABLE_COLOR: OnceLock<bool> = OnceLock::new();

const CHANNELS: [&str; 5] = ["System", "Application", "Security", "Setup", "ForwardedEvents"];
const DEFAULT_CHANNELS: [&str; 2] = ["System", "Application"];
const DEFAULT_HOURS: u64 = 1;
const DEFAULT_MAX: usize = 100_000;
const DEFAULT_CONFIG: &str = "EventTriage.toml";
const CONFIG_ENV: &str = "EVENTTRIAGE_CONFIG";

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogLevel { Error, Warn, Info, Debug, Trace }

#[derive(Clone, Copy, Debug, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogFormat { Text, Json }

#[derive(Parser, Debug)]
#[command(
    name = "EventTriage",
    about = "Summarize recent Windows event log activity",
    long_about = "Reads recent events from Windows event log channels (or exported .evtx files), resolves messages for errors, prints a summary and saves every event to a JSONL report.",
    after_long_help = "Examples:\n  EventTriage\n  EventTriage -t 24 -l System,Security --max 20000\n  EventTriage --evtx-path D:\\exports --evtx-glob sys* --text-format table\n  EventTriage -t 6 --md-path report.md --fail-on-errors",
    color = ColorChoice::Auto
)]
struct Args {
    /// Look back this many hours
    #[arg(long, short = 't', default_value_t = DEFAULT_HOURS, value_parser = clap::value_parser!(u64).range(1..))]
    hours: u64,
    /// Channels to read (default System,Application)
    #[arg(long, short = 'l', num_args = 1.., value_delimiter = ',', value_parser = clap::builder::PossibleValuesParser::new(CHANNELS))]
    logs: Vec<String>,
    /// Most events kept across all channels
    #[arg(long = "max", default_value_t = DEFAULT_MAX)]
    max_events: usize,
    #[arg(long, default_value_t = pipeline::DEFAULT_PAGE_SIZE, value_parser = clap::value_parser!(u16).range(1..=1024).map(usize::from))]
    page_size: usize,
    #[arg(long, short = 'n', default_value_t = aggregate::DEFAULT_TOP)]
    top: usize,
    /// Directory the JSONL report is written to
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    /// Exact JSONL report path (overrides --out-dir)
    #[arg(long)]
    report_path: Option<PathBuf>,
    /// Read exported .evtx files instead of the live event log (file or directory)
    #[arg(long, short = 'e')]
    evtx_path: Option<PathBuf>,
    #[arg(long)]
    evtx_glob: Option<String>,
    #[arg(long, default_value_t = false)]
    evtx_recursive: bool,
    #[arg(long, value_enum, default_value = "lines")]
    text_format: TextFormat,
    #[arg(long)]
    md_path: Option<PathBuf>,
    #[arg(long)]
    csv_path: Option<PathBuf>,
    /// Exit with status 1 when any Error or Critical event was found
    #[arg(long, default_value_t = false)]
    fail_on_errors: bool,
    #[arg(long, default_value_t = false)]
    progress: bool,
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
    #[arg(short = 'q', long, default_value_t = false)]
    quiet: bool,
    #[arg(long)]
    log_level: Option<LogLevel>,
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    log_path: Option<PathBuf>,
    #[arg(long, short = 'C', default_value_t = false)]
    no_color: bool,
    #[arg(long, default_value_t = false)]
    force_color: bool,
    #[arg(long, value_enum)]
    completions: Option<Shell>,
    #[arg(long)]
    completions_out: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            hours: DEFAULT_HOURS,
            logs: vec![],
            max_events: DEFAULT_MAX,
            page_size: pipeline::DEFAULT_PAGE_SIZE,
            top: aggregate::DEFAULT_TOP,
            out_dir: PathBuf::from("."),
            report_path: None,
            evtx_path: None,
            evtx_glob: None,
            evtx_recursive: false,
            text_format: TextFormat::Lines,
            md_path: None,
            csv_path: None,
            fail_on_errors: false,
            progress: false,
            verbose: 0,
            quiet: false,
            log_level: None,
            log_format: None,
            log_path: None,
            no_color: false,
            force_color: false,
            completions: None,
            completions_out: None,
            config: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct AppConfig {
    hours: Option<u64>,
    logs: Option<Vec<String>>,
    max: Option<usize>,
    page_size: Option<usize>,
    top: Option<usize>,
    out_dir: Option<PathBuf>,
    evtx_path: Option<PathBuf>,
    evtx_glob: Option<String>,
    evtx_recursive: Option<bool>,
    text_format: Option<TextFormat>,
    md_path: Option<PathBuf>,
    csv_path: Option<PathBuf>,
    fail_on_errors: Option<bool>,
    progress: Option<bool>,
    force_color: Option<bool>,
    log_level: Option<LogLevel>,
    log_format: Option<LogFormat>,
    log_path: Option<PathBuf>,
}

fn main() {
    let mut args = Args::parse();
    if let Some(sh) = args.completions {
        let mut cmd = Args::command();
        match args.completions_out.as_ref().map(std::fs::File::create) {
            Some(Ok(mut f)) => clap_complete::generate(sh, &mut cmd, "EventTriage", &mut f),
            _ => clap_complete::generate(sh, &mut cmd, "EventTriage", &mut std::io::stdout()),
        }
        return;
    }
    if let Some(p) = config_path(&args) {
        match load_config(&p) {
            Ok(cfg) => apply_config(&mut args, cfg),
            Err(e) => eprintln!("[!] Ignoring config: {:#}", e),
        }
    }
    init_logging(&args);
    let term = std::env::var("TERM").unwrap_or_default();
    let no_color_env = std::env::var_os("NO_COLOR").is_some();
    let color_default = std::io::stdout().is_terminal() && !no_color_env && term != "dumb";
    let enable_color = if args.force_color { true } else { color_default && !args.no_color };
    let _ = ENABLE_COLOR.set(enable_color);
    match run(&args) {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}", paint(&format!("[!] {:#}", e), "1;31"));
            std::process::exit(2);
        }
    }
}

fn config_path(args: &Args) -> Option<PathBuf> {
    if let Some(p) = args.config.as_ref() { return Some(p.clone()); }
    let def = PathBuf::from(DEFAULT_CONFIG);
    if def.is_file() { return Some(def); }
    std::env::var_os(CONFIG_ENV).map(PathBuf::from)
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str::<AppConfig>(&s).with_context(|| format!("parsing {}", path.display()))
}

/// Config values only fill options the command line left at their defaults.
fn apply_config(args: &mut Args, cfg: AppConfig) {
    if args.hours == DEFAULT_HOURS && let Some(v) = cfg.hours && v > 0 { args.hours = v; }
    if args.logs.is_empty() && let Some(v) = cfg.logs {
        let (known, unknown): (Vec<String>, Vec<String>) = v.into_iter().partition(|c| CHANNELS.contains(&c.as_str()));
        if !unknown.is_empty() { eprintln!("[!] Ignoring unknown channels in config: {}", unknown.join(", ")); }
        args.logs = known;
    }
    if args.max_events == DEFAULT_MAX && let Some(v) = cfg.max { args.max_events = v; }
    if args.page_size == pipeline::DEFAULT_PAGE_SIZE && let Some(v) = cfg.page_size { args.page_size = v.clamp(1, 1024); }
    if args.top == aggregate::DEFAULT_TOP && let Some(v) = cfg.top { args.top = v; }
    if args.out_dir == Path::new(".") && let Some(v) = cfg.out_dir { args.out_dir = v; }
    if args.evtx_path.is_none() && let Some(v) = cfg.evtx_path { args.evtx_path = Some(v); }
    if args.evtx_glob.is_none() && let Some(v) = cfg.evtx_glob { args.evtx_glob = Some(v); }
    if let Some(v) = cfg.evtx_recursive { args.evtx_recursive |= v; }
    if args.text_format == TextFormat::Lines && let Some(v) = cfg.text_format { args.text_format = v; }
    if args.md_path.is_none() && let Some(v) = cfg.md_path { args.md_path = Some(v); }
    if args.csv_path.is_none() && let Some(v) = cfg.csv_path { args.csv_path = Some(v); }
    if let Some(v) = cfg.fail_on_errors { args.fail_on_errors |= v; }
    if let Some(v) = cfg.progress { args.progress |= v; }
    if let Some(v) = cfg.force_color { args.force_color |= v; }
    if args.log_level.is_none() && let Some(v) = cfg.log_level { args.log_level = Some(v); }
    if args.log_format.is_none() && let Some(v) = cfg.log_format { args.log_format = Some(v); }
    if args.log_path.is_none() && let Some(v) = cfg.log_path { args.log_path = Some(v); }
}

fn level_filter(args: &Args) -> Option<log::LevelFilter> {
    if args.quiet { return Some(log::LevelFilter::Error); }
    if let Some(lvl) = args.log_level {
        return Some(match lvl { LogLevel::Error => log::LevelFilter::Error, LogLevel::Warn => log::LevelFilter::Warn, LogLevel::Info => log::LevelFilter::Info, LogLevel::Debug => log::LevelFilter::Debug, LogLevel::Trace => log::LevelFilter::Trace });
    }
    match args.verbose { 0 => None, 1 => Some(log::LevelFilter::Debug), _ => Some(log::LevelFilter::Trace) }
}

fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if let Some(f) = level_filter(args) { builder.filter_level(f); }
    match args.log_format {
        Some(LogFormat::Json) => {
            builder.format(|buf, record| {
                let obj = serde_json::json!({
                    "ts": Local::now().to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                });
                writeln!(buf, "{}", obj)
            });
        }
        Some(LogFormat::Text) => {
            builder.format(|buf, record| writeln!(buf, "[{:<5} {}] {}", record.level(), Local::now().format("%H:%M:%S"), record.args()));
        }
        None => {}
    }
    if let Some(path) = args.log_path.as_ref() {
        match std::fs::File::create(path) {
            Ok(f) => { builder.target(env_logger::Target::Pipe(Box::new(f))); }
            Err(e) => eprintln!("Failed to open log file {}: {}", path.display(), e),
        }
    }
    builder.init();
}

fn requested_channels(args: &Args) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let src: Vec<&str> = if args.logs.is_empty() { DEFAULT_CHANNELS.to_vec() } else { args.logs.iter().map(String::as_str).collect() };
    for c in src { if !out.iter().any(|o| o == c) { out.push(c.to_string()); } }
    out
}

fn run(args: &Args) -> anyhow::Result<i32> {
    let mut out = std::io::stdout().lock();
    if let Some(p) = args.evtx_path.as_ref() {
        let src = EvtxFileSource::discover(p, args.evtx_glob.as_deref(), args.evtx_recursive)?.with_limit(args.max_events);
        let channels = if args.logs.is_empty() { src.channels() } else { requested_channels(args) };
        if channels.is_empty() {
            writeln!(out, "{}", paint(&format!("[!] No .evtx files found under {}", p.display()), "33"))?;
            return Ok(0);
        }
        return analyze(&src, &DecoderFormatter, &channels, args, &mut out);
    }
    live(args, &mut out)
}

#[cfg(windows)]
fn live(args: &Args, out: &mut impl Write) -> anyhow::Result<i32> {
    analyze(&windows_live::WinEventSource, &windows_live::WinMessageFormatter, &requested_channels(args), args, out)
}

#[cfg(not(windows))]
fn live(args: &Args, out: &mut impl Write) -> anyhow::Result<i32> {
    writeln!(out, "{}", paint("[!] The live event log is only available on Windows; use --evtx-path for exported .evtx files", "33"))?;
    analyze(&EvtxFileSource::default(), &DecoderFormatter, &requested_channels(args), args, out)
}

/// Retrieve, summarize and persist. Returns the process exit status;
/// `Err` only when the report cannot be written.
fn analyze<S, F>(source: &S, formatter: &F, channels: &[String], args: &Args, out: &mut impl Write) -> anyhow::Result<i32>
where
    S: EventSource,
    F: MessageFormatter<S::Event>,
{
    let opts = RetrievalOptions { window: Window::from_hours(args.hours), ceiling: args.max_events, page_size: args.page_size.max(1), progress: args.progress };
    let mut resolver = MessageResolver::new(formatter);
    let mut write_err: Option<std::io::Error> = None;
    let retrieval = retrieve(source, &mut resolver, channels, &opts, |n| {
        let line = match n {
            Notice::Reading { channel, hours } => format!("[*] Reading {} for the last {}h...", channel, hours),
            Notice::OpenFailed(e) => paint(&format!("[!] Query failed: {}", e), "33"),
            Notice::PageFailed { channel, error } => paint(&format!("[!] {} stopped early: {}", channel, error), "33"),
            Notice::CeilingReached(n) => paint(&format!("[!] Reached the event limit of {}, truncating", n), "33"),
        };
        if write_err.is_none() && let Err(e) = writeln!(out, "{}", line) { write_err = Some(e); }
    });
    if let Some(e) = write_err { return Err(e.into()); }
    let dropped = &retrieval.dropped;
    if !dropped.is_empty() { log::info!("{} events dropped, {} of them unparseable", dropped.len(), retrieval.parse_failures()); }
    if retrieval.records.is_empty() {
        writeln!(out, "{}", paint(&format!("[!] No events in the last {}h, or insufficient privileges", args.hours), "33"))?;
        report::render_footer(out, &retrieval.channels, dropped)?;
        return Ok(0);
    }

    let summary = aggregate::summarize(&retrieval.records, args.top);
    report::render_summary(out, &summary, args.hours, args.text_format)?;

    let path = report::report_path(args.report_path.as_deref(), &args.out_dir, args.hours, Local::now());
    report::write_jsonl(&path, &retrieval.records).context("saving the event report")?;
    writeln!(out, "\n{}", paint(&format!("[+] Report saved: {}", path.display()), "1;32"))?;

    if let Some(p) = args.md_path.as_ref() {
        match std::fs::write(p, markdown::render_markdown(&summary, args.hours, &retrieval.channels, dropped.len())) {
            Ok(()) => writeln!(out, "[+] Markdown saved: {}", p.display())?,
            Err(e) => log::error!("failed to write {}: {}", p.display(), e),
        }
    }
    if let Some(p) = args.csv_path.as_ref() {
        match report::write_csv(p, &retrieval.records) {
            Ok(()) => writeln!(out, "[+] CSV saved: {}", p.display())?,
            Err(e) => log::error!("{:#}", e),
        }
    }
    report::render_footer(out, &retrieval.channels, dropped)?;
    if args.fail_on_errors && !summary.errors.is_empty() { return Ok(1); }
    Ok(0)
}

pub(crate) fn paint(s: &str, code: &str) -> String {
    if *ENABLE_COLOR.get().unwrap_or(&false) { format!("\x1b[{}m{}\x1b[0m", code, s) } else { s.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::sample_xml;
    use crate::resolver::stub::CountingFormatter;
    use crate::source::stub::StubSource;

    fn ev(level: i64, provider: &str, id: u32) -> Option<String> {
        Some(sample_xml(Some(id), level, provider, "2025-11-30T12:00:00Z"))
    }

    fn names(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    fn reports_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir).unwrap().filter_map(Result::ok).map(|e| e.path()).filter(|p| p.extension().is_some_and(|e| e == "jsonl")).collect()
    }

    #[test]
    fn defaults_match_parser() {
        let parsed = Args::parse_from(["EventTriage"]);
        let def = Args::default();
        assert_eq!(parsed.hours, def.hours);
        assert_eq!(parsed.max_events, def.max_events);
        assert_eq!(parsed.page_size, def.page_size);
        assert_eq!(parsed.top, def.top);
        assert_eq!(parsed.out_dir, def.out_dir);
        assert_eq!(requested_channels(&parsed), names(&["System", "Application"]));
    }

    #[test]
    fn logs_are_restricted_and_deduplicated() {
        assert!(Args::try_parse_from(["EventTriage", "-l", "Bogus"]).is_err());
        assert!(Args::try_parse_from(["EventTriage", "-t", "0"]).is_err());
        let a = Args::parse_from(["EventTriage", "-l", "Security,System", "-l", "Security", "-t", "24", "--max", "500"]);
        assert_eq!(requested_channels(&a), names(&["Security", "System"]));
        assert_eq!(a.hours, 24);
        assert_eq!(a.max_events, 500);
    }

    #[test]
    fn verbosity_maps_to_levels() {
        let a = Args::parse_from(["EventTriage", "-v"]);
        assert_eq!(level_filter(&a), Some(log::LevelFilter::Debug));
        let a = Args::parse_from(["EventTriage", "-vv"]);
        assert_eq!(level_filter(&a), Some(log::LevelFilter::Trace));
        let a = Args::parse_from(["EventTriage", "-vv", "-q"]);
        assert_eq!(level_filter(&a), Some(log::LevelFilter::Error));
        assert_eq!(level_filter(&Args::default()), None);
    }

    #[test]
    fn config_fills_defaults_only() {
        let cfg: AppConfig = toml::from_str("hours = 12\nlogs = [\"Setup\", \"Nope\"]\nmax = 10\ntext_format = \"table\"\nlog_format = \"json\"\n").unwrap();
        let mut a = Args { max_events: 77, ..Default::default() };
        apply_config(&mut a, cfg);
        assert_eq!(a.hours, 12);
        assert_eq!(a.logs, names(&["Setup"]));
        assert_eq!(a.max_events, 77);
        assert_eq!(a.text_format, TextFormat::Table);
        assert!(matches!(a.log_format, Some(LogFormat::Json)));
    }

    #[test]
    fn config_file_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("bad.toml");
        std::fs::write(&p, "hours = \"many\"").unwrap();
        assert!(load_config(&p).is_err());
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
        let a = Args { config: Some(p.clone()), ..Default::default() };
        assert_eq!(config_path(&a), Some(p));
    }

    #[test]
    fn end_to_end_two_channels() {
        let dir = tempfile::tempdir().unwrap();
        let src = StubSource::default()
            .with_channel("System", vec![ev(4, "EventLog", 6005), ev(2, "Service Control Manager", 7000), ev(3, "Disk", 51)])
            .with_channel("Application", vec![ev(1, "Application Error", 1000), ev(4, "EventLog", 6005)]);
        let f = CountingFormatter::default();
        let args = Args { out_dir: dir.path().to_path_buf(), fail_on_errors: true, md_path: Some(dir.path().join("r.md")), ..Default::default() };
        let mut out = Vec::new();
        let code = analyze(&src, &f, &names(&["System", "Application"]), &args, &mut out).unwrap();
        assert_eq!(code, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Info: 2\nError: 1\nWarning: 1\nCritical: 1\n"));
        assert!(text.contains("[+] Report saved:"));
        let reports = reports_in(dir.path());
        assert_eq!(reports.len(), 1);
        let name = reports[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("event_report_last1h_"));
        assert_eq!(std::fs::read_to_string(&reports[0]).unwrap().lines().count(), 5);
        assert!(std::fs::read_to_string(dir.path().join("r.md")).unwrap().contains("- Total Events: 5"));
    }

    #[test]
    fn no_events_writes_no_report() {
        let dir = tempfile::tempdir().unwrap();
        let src = StubSource { fail_open: names(&["Security"]), ..Default::default() }.with_channel("System", vec![]);
        let f = CountingFormatter::default();
        let args = Args { out_dir: dir.path().to_path_buf(), fail_on_errors: true, ..Default::default() };
        let mut out = Vec::new();
        let code = analyze(&src, &f, &names(&["Security", "System"]), &args, &mut out).unwrap();
        assert_eq!(code, 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("[!] Query failed:"));
        assert!(text.contains("No events in the last 1h"));
        assert!(reports_in(dir.path()).is_empty());
        let pos = |needle: &str| text.find(needle).unwrap();
        assert!(pos("[*] Reading Security") < pos("[!] Query failed"));
        assert!(pos("[!] Query failed") < pos("[*] Reading System"));
        assert_eq!(text.matches("[*] Reading").count(), 2);
    }

    #[cfg(not(windows))]
    #[test]
    fn live_mode_off_windows_reports_and_exits_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args { out_dir: dir.path().to_path_buf(), logs: names(&["System"]), ..Default::default() };
        let mut out = Vec::new();
        assert_eq!(live(&args, &mut out).unwrap(), 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("only available on Windows"));
        assert!(text.contains("System: 0 records, not opened"));
        assert!(reports_in(dir.path()).is_empty());
    }

    #[test]
    fn truncation_notice_printed_once() {
        let dir = tempfile::tempdir().unwrap();
        let src = StubSource::default()
            .with_channel("System", vec![ev(4, "A", 1), ev(4, "A", 1), ev(4, "A", 1)])
            .with_channel("Application", vec![ev(4, "B", 2)]);
        let f = CountingFormatter::default();
        let args = Args { out_dir: dir.path().to_path_buf(), max_events: 2, ..Default::default() };
        let mut out = Vec::new();
        let code = analyze(&src, &f, &names(&["System", "Application"]), &args, &mut out).unwrap();
        assert_eq!(code, 0);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("Reached the event limit of 2").count(), 1);
        assert!(text.contains("Application: 0 records, skipped"));
    }

    #[test]
    fn unwritable_report_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let src = StubSource::default().with_channel("System", vec![ev(4, "A", 1)]);
        let f = CountingFormatter::default();
        let args = Args { report_path: Some(dir.path().to_path_buf()), ..Default::default() };
        let mut out = Vec::new();
        assert!(analyze(&src, &f, &names(&["System"]), &args, &mut out).is_err());
    }

    #[test]
    fn paint_is_plain_without_color() {
        assert_eq!(paint("x", "31"), "x");
    }
}
