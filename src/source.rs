use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open channel {channel}: {reason}")]
    Open { channel: String, reason: String },
    #[error("reading next page failed: {0}")]
    Page(String),
    #[error("rendering event failed: {0}")]
    Render(String),
}

/// How far back a query reaches, expressed the way the event log query
/// language wants it: a maximum age in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window { max_age_ms: u64 }

impl Window {
    pub fn from_hours(hours: u64) -> Self { Window { max_age_ms: hours.saturating_mul(60 * 60 * 1000) } }

    pub fn max_age_ms(&self) -> u64 { self.max_age_ms }

    /// Oldest creation time still inside the window.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ms = i64::try_from(self.max_age_ms).unwrap_or(i64::MAX);
        Duration::try_milliseconds(ms).and_then(|d| now.checked_sub_signed(d)).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn xpath(&self) -> String {
        format!("*[System[TimeCreated[timediff(@SystemTime) <= {}]]]", self.max_age_ms)
    }
}

/// A queryable log. `open` starts a newest-first query over one channel,
/// `next_page` hands out up to `page_size` opaque events (empty means the
/// sequence is over) and `render` turns one of them into event XML.
///
/// Sessions and events release whatever they hold when dropped.
pub trait EventSource {
    type Session;
    type Event;

    fn open(&self, channel: &str, window: Window) -> Result<Self::Session, SourceError>;
    fn next_page(&self, session: &mut Self::Session, page_size: usize) -> Result<Vec<Self::Event>, SourceError>;
    fn render(&self, event: &Self::Event) -> Result<String, SourceError>;
}

/// Lazily pages through one channel. A failing page ends the sequence; the
/// cause is kept for [`ChannelEvents::take_failure`]. The session is dropped
/// as soon as the sequence ends, or with the iterator on an early stop.
pub struct ChannelEvents<'s, S: EventSource> {
    source: &'s S,
    session: Option<S::Session>,
    page: std::vec::IntoIter<S::Event>,
    page_size: usize,
    failure: Option<SourceError>,
}

impl<'s, S: EventSource> ChannelEvents<'s, S> {
    pub fn open(source: &'s S, channel: &str, window: Window, page_size: usize) -> Result<Self, SourceError> {
        let session = source.open(channel, window)?;
        Ok(ChannelEvents { source, session: Some(session), page: Vec::new().into_iter(), page_size: page_size.max(1), failure: None })
    }

    pub fn take_failure(&mut self) -> Option<SourceError> { self.failure.take() }
}

impl<S: EventSource> Iterator for ChannelEvents<'_, S> {
    type Item = S::Event;

    fn next(&mut self) -> Option<S::Event> {
        loop {
            if let Some(ev) = self.page.next() { return Some(ev); }
            let session = self.session.as_mut()?;
            match self.source.next_page(session, self.page_size) {
                Ok(batch) if batch.is_empty() => { self.session = None; return None; }
                Ok(batch) => self.page = batch.into_iter(),
                Err(e) => {
                    log::debug!("{}", e);
                    self.failure = Some(e);
                    self.session = None;
                    return None;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::stub::*;

    fn items(n: usize) -> Vec<Option<String>> { (0..n).map(|i| Some(format!("<e{}/>", i))).collect() }

    #[test]
    fn window_from_hours() {
        let w = Window::from_hours(1);
        assert_eq!(w.max_age_ms(), 3_600_000);
        assert_eq!(w.xpath(), "*[System[TimeCreated[timediff(@SystemTime) <= 3600000]]]");
        let now = Utc::now();
        assert_eq!(now - w.cutoff(now), Duration::hours(1));
    }

    #[test]
    fn huge_window_does_not_overflow() {
        let w = Window::from_hours(u64::MAX);
        assert_eq!(w.cutoff(Utc::now()), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn pages_until_empty_batch() {
        let src = StubSource::default().with_channel("System", items(5));
        let mut it = ChannelEvents::open(&src, "System", Window::from_hours(1), 2).unwrap();
        let got: Vec<StubEvent> = it.by_ref().collect();
        assert_eq!(got.len(), 5);
        assert!(it.take_failure().is_none());
        // 2 + 2 + 1, then the empty page that ends the sequence
        assert_eq!(src.pages_served.get(), 4);
        assert_eq!(src.open_sessions.get(), 0);
    }

    #[test]
    fn page_failure_ends_sequence_and_is_kept() {
        let src = StubSource { fail_page_at: Some(1), ..Default::default() }.with_channel("System", items(5));
        let mut it = ChannelEvents::open(&src, "System", Window::from_hours(1), 2).unwrap();
        assert_eq!(it.by_ref().count(), 2);
        assert!(matches!(it.take_failure(), Some(SourceError::Page(_))));
        assert_eq!(src.open_sessions.get(), 0);
    }

    #[test]
    fn early_drop_releases_session() {
        let src = StubSource::default().with_channel("System", items(10));
        {
            let mut it = ChannelEvents::open(&src, "System", Window::from_hours(1), 3).unwrap();
            assert!(it.next().is_some());
            assert_eq!(src.open_sessions.get(), 1);
        }
        assert_eq!(src.open_sessions.get(), 0);
    }

    #[test]
    fn open_failure_is_reported() {
        let src = StubSource { fail_open: vec!["Security".to_string()], ..Default::default() };
        let err = ChannelEvents::open(&src, "Security", Window::from_hours(1), 50).err().unwrap();
        assert!(err.to_string().contains("access denied"));
    }
}
