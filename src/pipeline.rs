use crate::parser::{ParseError, parse_record};
use crate::record::EventRecord;
use crate::resolver::{MessageFormatter, MessageResolver};
use crate::source::{ChannelEvents, EventSource, SourceError, Window};

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Clone, Debug)]
pub struct RetrievalOptions {
    pub window: Window,
    /// Most records kept across all channels together.
    pub ceiling: usize,
    pub page_size: usize,
    pub progress: bool,
}

/// How reading one channel ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelOutcome {
    Exhausted,
    OpenFailed(String),
    PageFailed(String),
    Truncated,
    /// Not read because the ceiling was hit in an earlier channel.
    Skipped,
}

#[derive(Clone, Debug)]
pub struct ChannelReport {
    pub channel: String,
    pub retained: usize,
    pub outcome: ChannelOutcome,
}

#[derive(Debug)]
pub enum DropReason {
    Render(SourceError),
    Parse(ParseError),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self { DropReason::Render(e) => e.fmt(f), DropReason::Parse(e) => write!(f, "unparseable event: {}", e) }
    }
}

/// An event that was read but could not be turned into a record.
#[derive(Debug)]
pub struct DroppedEvent {
    pub channel: String,
    pub reason: DropReason,
}

#[derive(Debug, Default)]
pub struct Retrieval {
    pub records: Vec<EventRecord>,
    pub channels: Vec<ChannelReport>,
    pub dropped: Vec<DroppedEvent>,
    pub truncated: bool,
}

impl Retrieval {
    pub fn parse_failures(&self) -> usize {
        self.dropped.iter().filter(|d| matches!(d.reason, DropReason::Parse(_))).count()
    }
}

/// Progress the caller may want to show as retrieval reaches it.
#[derive(Debug)]
pub enum Notice<'a> {
    Reading { channel: &'a str, hours: u64 },
    OpenFailed(&'a SourceError),
    PageFailed { channel: &'a str, error: &'a SourceError },
    /// Emitted once, when the first record over the ceiling is met.
    CeilingReached(usize),
}

/// The one record counter shared by every channel of a run.
#[derive(Clone, Copy, Debug)]
pub struct RecordBudget { ceiling: usize, used: usize }

impl RecordBudget {
    pub fn new(ceiling: usize) -> Self { RecordBudget { ceiling, used: 0 } }
    pub fn exhausted(&self) -> bool { self.used >= self.ceiling }
    pub fn take(&mut self) { self.used += 1; }
}

/// Read `channels` in order, newest event first within each, and build
/// records. Error and Critical records get their message from `resolver`.
///
/// Every failure short of a bug is absorbed here: a channel that cannot be
/// opened contributes nothing, a failing page ends its channel, a bad event
/// is dropped. Reaching the ceiling stops the whole run.
pub fn retrieve<S, F>(source: &S, resolver: &mut MessageResolver<'_, S::Event, F>, channels: &[String], opts: &RetrievalOptions, mut notify: impl FnMut(Notice<'_>)) -> Retrieval
where
    S: EventSource,
    F: MessageFormatter<S::Event>,
{
    let mut out = Retrieval::default();
    let mut budget = RecordBudget::new(opts.ceiling);
    let hours = opts.window.max_age_ms() / 3_600_000;
    for ch in channels {
        if out.truncated {
            out.channels.push(ChannelReport { channel: ch.clone(), retained: 0, outcome: ChannelOutcome::Skipped });
            continue;
        }
        log::info!("reading {} for the last {}h", ch, hours);
        notify(Notice::Reading { channel: ch, hours });
        let mut events = match ChannelEvents::open(source, ch, opts.window, opts.page_size) {
            Ok(it) => it,
            Err(e) => {
                log::debug!("{}", e);
                notify(Notice::OpenFailed(&e));
                out.channels.push(ChannelReport { channel: ch.clone(), retained: 0, outcome: ChannelOutcome::OpenFailed(e.to_string()) });
                continue;
            }
        };
        let pb = if opts.progress { Some(indicatif::ProgressBar::new_spinner()) } else { None };
        if let Some(ref pb) = pb { pb.set_message(format!("Reading {}", ch)); }
        let mut seen = 0usize;
        let mut retained = 0usize;
        let mut outcome = ChannelOutcome::Exhausted;
        for ev in events.by_ref() {
            if budget.exhausted() {
                log::info!("record ceiling {} reached, stopping retrieval", opts.ceiling);
                notify(Notice::CeilingReached(opts.ceiling));
                out.truncated = true;
                outcome = ChannelOutcome::Truncated;
                break;
            }
            seen += 1;
            if let Some(ref pb) = pb && seen % 500 == 0 { pb.set_message(format!("{}: {} events", ch, seen)); pb.tick(); }
            let xml = match source.render(&ev) {
                Ok(x) => x,
                Err(e) => {
                    let d = DroppedEvent { channel: ch.clone(), reason: DropReason::Render(e) };
                    log::debug!("{}: {}", d.channel, d.reason);
                    out.dropped.push(d);
                    continue;
                }
            };
            let mut rec = match parse_record(&xml) {
                Ok(r) => r,
                Err(e) => {
                    let d = DroppedEvent { channel: ch.clone(), reason: DropReason::Parse(e) };
                    log::debug!("{}: {}", d.channel, d.reason);
                    out.dropped.push(d);
                    continue;
                }
            };
            if rec.level.is_error() {
                rec.message = resolver.resolve(&rec.source, &ev).into_text();
            }
            budget.take();
            retained += 1;
            out.records.push(rec);
        }
        if outcome == ChannelOutcome::Exhausted && let Some(e) = events.take_failure() {
            notify(Notice::PageFailed { channel: ch, error: &e });
            outcome = ChannelOutcome::PageFailed(e.to_string());
        }
        drop(events);
        if let Some(pb) = pb { pb.finish_and_clear(); }
        log::debug!("{}: {} events read, {} kept", ch, seen, retained);
        out.channels.push(ChannelReport { channel: ch.clone(), retained, outcome });
    }
    log::debug!("publisher metadata cached for {} providers", resolver.cached_providers());
    out
}
