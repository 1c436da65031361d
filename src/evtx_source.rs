use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use anyhow::Context;
use chrono::{DateTime, Utc};
use evtx::EvtxParser;
use crate::source::{EventSource, SourceError, Window};

/// Exported `.evtx` files, each standing in for the channel named by its file stem.
#[derive(Clone, Debug, Default)]
pub struct EvtxFileSource {
    files: Vec<(String, PathBuf)>,
    /// Most records kept per opened channel; `None` keeps the whole window.
    limit: Option<usize>,
}

/// One record read from a file. The XML is already rendered by the parser.
#[derive(Clone, Debug)]
pub struct EvtxEvent {
    pub record_id: u64,
    pub timestamp: DateTime<Utc>,
    pub xml: String,
}

pub struct EvtxSession { events: std::vec::IntoIter<EvtxEvent> }

/// Keeps the newest `limit` events pushed into it, oldest evicted first.
struct NewestEvents {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, String)>>,
    limit: usize,
}

impl NewestEvents {
    fn new(limit: usize) -> Self { NewestEvents { heap: BinaryHeap::new(), limit } }

    fn push(&mut self, ev: EvtxEvent) {
        if self.limit == 0 { return; }
        if self.heap.len() == self.limit {
            match self.heap.peek() {
                Some(Reverse((ts, id, _))) if (ev.timestamp, ev.record_id) <= (*ts, *id) => return,
                _ => { self.heap.pop(); }
            }
        }
        self.heap.push(Reverse((ev.timestamp, ev.record_id, ev.xml)));
    }

    fn len(&self) -> usize { self.heap.len() }

    /// Newest first.
    fn into_events(self) -> Vec<EvtxEvent> {
        self.heap.into_sorted_vec().into_iter().map(|Reverse((timestamp, record_id, xml))| EvtxEvent { record_id, timestamp, xml }).collect()
    }
}

impl EvtxFileSource {
    /// A single file, or every `*.evtx` under a directory (optionally filtered by
    /// a case-insensitive file name glob).
    pub fn discover(path: &Path, glob: Option<&str>, recursive: bool) -> anyhow::Result<Self> {
        if path.is_file() {
            return Ok(EvtxFileSource { files: vec![(channel_name(path), path.to_path_buf())], limit: None });
        }
        if !path.is_dir() { anyhow::bail!("EVTX path is neither file nor directory: {}", path.display()); }
        let matcher = match glob {
            Some(g) => Some(globset::GlobBuilder::new(g).case_insensitive(true).build().with_context(|| format!("invalid --evtx-glob {}", g))?.compile_matcher()),
            None => None,
        };
        let wd = if recursive { walkdir::WalkDir::new(path) } else { walkdir::WalkDir::new(path).max_depth(1) };
        let mut files = Vec::new();
        for de in wd.sort_by_file_name().into_iter().filter_map(Result::ok) {
            let fp = de.path();
            if !fp.is_file() { continue; }
            if !fp.extension().and_then(|e| e.to_str()).is_some_and(|s| s.eq_ignore_ascii_case("evtx")) { continue; }
            if let Some(m) = &matcher && !fp.file_name().is_some_and(|n| m.is_match(n)) { continue; }
            files.push((channel_name(fp), fp.to_path_buf()));
        }
        Ok(EvtxFileSource { files, limit: None })
    }

    /// Bound the records buffered per channel. Only the newest `limit` in the
    /// window are kept, since no run keeps more than that in total.
    pub fn with_limit(mut self, limit: usize) -> Self { self.limit = Some(limit); self }

    pub fn channels(&self) -> Vec<String> { self.files.iter().map(|(c, _)| c.clone()).collect() }

    fn path_for(&self, channel: &str) -> Option<&Path> {
        self.files.iter().find(|(c, _)| c == channel).map(|(_, p)| p.as_path())
    }
}

fn channel_name(p: &Path) -> String {
    p.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_string()
}

impl EventSource for EvtxFileSource {
    type Session = EvtxSession;
    type Event = EvtxEvent;

    /// Reads the records inside the window and orders them newest first;
    /// files are stored oldest first, so this cannot be done lazily. At most
    /// `limit` records are held at any time.
    fn open(&self, channel: &str, window: Window) -> Result<EvtxSession, SourceError> {
        let open_err = |reason: String| SourceError::Open { channel: channel.to_string(), reason };
        let path = self.path_for(channel).ok_or_else(|| open_err("no EVTX file for this channel".to_string()))?;
        if !path.exists() { return Err(open_err(format!("missing {}", path.display()))); }
        let mut parser = EvtxParser::from_path(path)
            .map_err(|e| open_err(format!("{} (reading .evtx may require Administrator privileges)", e)))?;
        let cutoff = window.cutoff(Utc::now());
        let mut events = NewestEvents::new(self.limit.unwrap_or(usize::MAX));
        let mut bad = 0usize;
        for r in parser.records() {
            match r {
                Ok(r) if r.timestamp >= cutoff => events.push(EvtxEvent { record_id: r.event_record_id, timestamp: r.timestamp, xml: r.data }),
                Ok(_) => {}
                Err(e) => { bad += 1; log::trace!("skipping unreadable record in {}: {}", path.display(), e); }
            }
        }
        if bad > 0 { log::debug!("{}: {} unreadable records skipped", channel, bad); }
        log::trace!("{}: {} records buffered", channel, events.len());
        Ok(EvtxSession { events: events.into_events().into_iter() })
    }

    fn next_page(&self, session: &mut EvtxSession, page_size: usize) -> Result<Vec<EvtxEvent>, SourceError> {
        Ok(session.events.by_ref().take(page_size).collect())
    }

    fn render(&self, event: &EvtxEvent) -> Result<String, SourceError> { Ok(event.xml.clone()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(p: &Path) { std::fs::write(p, b"not really an event log").unwrap(); }

    #[test]
    fn discovers_evtx_files_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("System.evtx"));
        touch(&dir.path().join("Application.EVTX"));
        touch(&dir.path().join("notes.txt"));
        let src = EvtxFileSource::discover(dir.path(), None, false).unwrap();
        assert_eq!(src.channels(), vec!["Application".to_string(), "System".to_string()]);
    }

    #[test]
    fn glob_filters_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("System.evtx"));
        touch(&dir.path().join("Setup.evtx"));
        touch(&dir.path().join("Application.evtx"));
        let src = EvtxFileSource::discover(dir.path(), Some("s*"), false).unwrap();
        assert_eq!(src.channels(), vec!["Setup".to_string(), "System".to_string()]);
    }

    #[test]
    fn recursion_is_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("archive")).unwrap();
        touch(&dir.path().join("archive").join("Old.evtx"));
        assert!(EvtxFileSource::discover(dir.path(), None, false).unwrap().channels().is_empty());
        assert_eq!(EvtxFileSource::discover(dir.path(), None, true).unwrap().channels(), vec!["Old".to_string()]);
    }

    #[test]
    fn single_file_is_one_channel() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("ForwardedEvents.evtx");
        touch(&p);
        assert_eq!(EvtxFileSource::discover(&p, None, false).unwrap().channels(), vec!["ForwardedEvents".to_string()]);
    }

    #[test]
    fn open_fails_for_unknown_missing_or_garbage() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("System.evtx"));
        let src = EvtxFileSource::discover(dir.path(), None, false).unwrap();
        let w = Window::from_hours(1);
        assert!(matches!(src.open("Application", w), Err(SourceError::Open { .. })));
        assert!(matches!(src.open("System", w), Err(SourceError::Open { .. })));
        assert!(matches!(EvtxFileSource::default().open("System", w), Err(SourceError::Open { .. })));
    }

    #[test]
    fn pages_newest_first() {
        let now = Utc::now();
        let ev = |id: u64, mins: i64| EvtxEvent { record_id: id, timestamp: now - chrono::Duration::minutes(mins), xml: format!("<e{}/>", id) };
        let mut events = vec![ev(1, 30), ev(2, 10), ev(3, 20)];
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.record_id.cmp(&a.record_id)));
        let src = EvtxFileSource::default();
        let mut session = EvtxSession { events: events.into_iter() };
        let page = src.next_page(&mut session, 2).unwrap();
        assert_eq!(page.iter().map(|e| e.record_id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(src.render(&page[0]).unwrap(), "<e2/>");
        assert_eq!(src.next_page(&mut session, 2).unwrap().len(), 1);
        assert!(src.next_page(&mut session, 2).unwrap().is_empty());
    }

    #[test]
    fn buffer_keeps_only_the_newest() {
        let now = Utc::now();
        let mut buf = NewestEvents::new(3);
        for i in 0..100u64 {
            let mins = ((i * 37) % 100) as i64;
            buf.push(EvtxEvent { record_id: i, timestamp: now - chrono::Duration::minutes(mins), xml: String::new() });
            assert!(buf.len() <= 3);
        }
        let minutes: Vec<i64> = buf.into_events().iter().map(|e| (now - e.timestamp).num_minutes()).collect();
        assert_eq!(minutes, vec![0, 1, 2]);
    }

    #[test]
    fn zero_limit_buffers_nothing() {
        let mut buf = NewestEvents::new(0);
        buf.push(EvtxEvent { record_id: 1, timestamp: Utc::now(), xml: String::new() });
        assert_eq!(buf.len(), 0);
    }
}
