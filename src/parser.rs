use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event as XmlEvent};
use thiserror::Error;
use crate::record::{EventRecord, Level};

/// Why a single rendered event could not become an [`EventRecord`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed event XML: {0}")]
    Xml(String),
    #[error("missing System/{0}")]
    MissingField(&'static str),
    #[error("System/{field} is not an integer: {value:?}")]
    BadInteger { field: &'static str, value: String },
    #[error("unparseable SystemTime {0:?}")]
    BadTimestamp(String),
}

#[derive(Default)]
struct SystemFields {
    event_id: Option<String>,
    level: Option<String>,
    provider: Option<String>,
    time: Option<String>,
}

/// Parse the rendered XML of one event into a record with an empty message.
///
/// Only children of `<System>` are considered. Every one of `EventID`, `Level`,
/// `Provider/@Name` and `TimeCreated/@SystemTime` must be present and valid.
pub fn parse_record(xml: &str) -> Result<EventRecord, ParseError> {
    let f = read_system_fields(xml)?;
    let event_id: u32 = parse_int("EventID", f.event_id)?;
    let raw_level: i64 = parse_int("Level", f.level)?;
    let source = f.provider.ok_or(ParseError::MissingField("Provider/@Name"))?;
    let time_s = f.time.ok_or(ParseError::MissingField("TimeCreated/@SystemTime"))?;
    let utc = parse_system_time(&time_s).ok_or(ParseError::BadTimestamp(time_s))?;
    Ok(EventRecord {
        timestamp: to_local(utc),
        level: Level::from_code(raw_level),
        source,
        event_id,
        raw_level,
        message: String::new(),
    })
}

fn read_system_fields(xml: &str) -> Result<SystemFields, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut out = SystemFields::default();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => {
                let name = local_name(&e);
                if path.last().map(String::as_str) == Some("System") { take_attrs(&name, &e, &mut out); }
                path.push(name);
            }
            Ok(XmlEvent::Empty(e)) => {
                if path.last().map(String::as_str) == Some("System") { take_attrs(&local_name(&e), &e, &mut out); }
            }
            Ok(XmlEvent::End(_)) => { path.pop(); }
            Ok(XmlEvent::Text(t)) => {
                let in_system = path.len() >= 2 && path[path.len() - 2] == "System";
                if in_system {
                    let v = String::from_utf8_lossy(t.as_ref()).trim().to_string();
                    match path.last().map(String::as_str) {
                        Some("EventID") if out.event_id.is_none() => out.event_id = Some(v),
                        Some("Level") if out.level.is_none() => out.level = Some(v),
                        _ => {}
                    }
                }
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(ParseError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn take_attrs(name: &str, e: &BytesStart<'_>, out: &mut SystemFields) {
    let (wanted, slot) = match name {
        "Provider" => ("Name", &mut out.provider),
        "TimeCreated" => ("SystemTime", &mut out.time),
        _ => return,
    };
    if slot.is_some() { return; }
    for a in e.attributes().flatten() {
        if a.key.local_name().as_ref() == wanted.as_bytes()
            && let Ok(v) = a.unescape_value() {
            *slot = Some(v.into_owned());
        }
    }
}

fn parse_int<T: std::str::FromStr>(field: &'static str, v: Option<String>) -> Result<T, ParseError> {
    let v = v.ok_or(ParseError::MissingField(field))?;
    v.trim().parse::<T>().map_err(|_| ParseError::BadInteger { field, value: v })
}

/// Accepts RFC 3339 (`...Z` or an explicit offset). A bare `YYYY-MM-DD HH:MM:SS[.f]`
/// is taken as UTC, which is how exported logs sometimes carry it.
pub fn parse_system_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) { return Some(dt.with_timezone(&Utc)); }
    let mut alt = s.replace(' ', "T");
    if !alt.ends_with('Z') && !alt.contains('+') { alt.push('Z'); }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&alt) { return Some(dt.with_timezone(&Utc)); }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") { return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)); }
    None
}

fn to_local(dt: DateTime<Utc>) -> DateTime<FixedOffset> { dt.with_timezone(&Local).fixed_offset() }

#[cfg(test)]
pub(crate) fn sample_xml(event_id: Option<u32>, level: i64, provider: &str, time: &str) -> String {
    let eid = event_id.map(|id| format!("<EventID Qualifiers=\"16384\">{}</EventID>", id)).unwrap_or_default();
    format!(
        "<Event xmlns=\"http://schemas.microsoft.com/win/2004/08/events/event\"><System><Provider Name=\"{}\" Guid=\"{{555908d1-a6d7-4695-8e1e-26931d2012f4}}\"/>{}<Version>0</Version><Level>{}</Level><TimeCreated SystemTime=\"{}\"/><Channel>System</Channel></System><EventData><Data Name=\"param1\">x</Data></EventData></Event>",
        provider, eid, level, time
    )
}
