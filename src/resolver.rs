use std::collections::HashMap;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("no publisher metadata for {provider}: {reason}")]
    Metadata { provider: String, reason: String },
    #[error("message formatting failed: {0}")]
    Format(String),
}

/// Turns an event of type `E` into its human-readable message with the help
/// of per-provider metadata.
pub trait MessageFormatter<E> {
    type Metadata;

    fn open_metadata(&self, provider: &str) -> Result<Self::Metadata, FormatError>;
    fn format_message(&self, metadata: &Self::Metadata, event: &E) -> Result<String, FormatError>;
}

/// Outcome of resolving one message. Failures are kept apart so callers can
/// tell them from a real message, but they never stop retrieval.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Enrichment {
    Resolved(String),
    Unavailable,
    FormatFailed,
}

impl Enrichment {
    pub const UNAVAILABLE_TEXT: &'static str = "[metadata unavailable]";
    pub const FORMAT_FAILED_TEXT: &'static str = "[message could not be formatted]";

    pub fn into_text(self) -> String {
        match self {
            Enrichment::Resolved(s) => s,
            Enrichment::Unavailable => Self::UNAVAILABLE_TEXT.to_string(),
            Enrichment::FormatFailed => Self::FORMAT_FAILED_TEXT.to_string(),
        }
    }
}

/// Provider metadata kept for the whole run. Entries are only ever added.
pub struct ProviderCache<M> { entries: HashMap<String, M> }

impl<M> Default for ProviderCache<M> {
    fn default() -> Self { ProviderCache { entries: HashMap::new() } }
}

impl<M> ProviderCache<M> {
    /// Returns the cached entry for `provider`, calling `create` only when there is none.
    /// A failed `create` leaves nothing behind, so the next call tries again.
    pub fn get_or_try_insert_with<E>(&mut self, provider: &str, create: impl FnOnce() -> Result<M, E>) -> Result<&M, E> {
        if !self.entries.contains_key(provider) {
            let m = create()?;
            self.entries.insert(provider.to_string(), m);
        }
        Ok(&self.entries[provider])
    }

    pub fn len(&self) -> usize { self.entries.len() }
}

pub struct MessageResolver<'f, E, F: MessageFormatter<E>> {
    formatter: &'f F,
    cache: ProviderCache<F::Metadata>,
    _event: PhantomData<fn(&E)>,
}

impl<'f, E, F: MessageFormatter<E>> MessageResolver<'f, E, F> {
    pub fn new(formatter: &'f F) -> Self {
        MessageResolver { formatter, cache: ProviderCache::default(), _event: PhantomData }
    }

    pub fn resolve(&mut self, provider: &str, event: &E) -> Enrichment {
        let formatter = self.formatter;
        let meta = match self.cache.get_or_try_insert_with(provider, || formatter.open_metadata(provider)) {
            Ok(m) => m,
            Err(e) => { log::debug!("{}", e); return Enrichment::Unavailable; }
        };
        match formatter.format_message(meta, event) {
            Ok(msg) => Enrichment::Resolved(msg.trim().to_string()),
            Err(e) => { log::debug!("{} ({})", e, provider); Enrichment::FormatFailed }
        }
    }

    pub fn cached_providers(&self) -> usize { self.cache.len() }
}
