use std::collections::HashMap;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event as XmlEvent};

/// `<EventData><Data Name="k">v</Data>...` as a map. Classic events carry
/// unnamed `<Data>` elements; those are keyed `param1`, `param2`, ... in order.
pub fn event_data(xml: &str) -> HashMap<String, String> {
    let m = event_data_xml(xml);
    if m.is_empty() { event_data_scan(xml) } else { m }
}

fn data_name(e: &BytesStart<'_>) -> Option<String> {
    e.attributes().flatten()
        .find(|a| a.key.local_name().as_ref() == b"Name")
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn event_data_xml(xml: &str) -> HashMap<String, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_event_data = false;
    let mut unnamed = 0usize;
    let mut cur: Option<String> = None;
    let mut out = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => match e.local_name().as_ref() {
                b"EventData" => in_event_data = true,
                b"Data" if in_event_data => {
                    cur = Some(data_name(&e).unwrap_or_else(|| { unnamed += 1; format!("param{}", unnamed) }));
                }
                _ => {}
            },
            Ok(XmlEvent::Empty(e)) if in_event_data && e.local_name().as_ref() == b"Data" => {
                if data_name(&e).is_none() { unnamed += 1; }
            }
            Ok(XmlEvent::End(e)) => match e.local_name().as_ref() {
                b"EventData" => in_event_data = false,
                b"Data" => cur = None,
                _ => {}
            },
            Ok(XmlEvent::Text(t)) => {
                if let Some(n) = cur.as_ref() {
                    let v = t.unescape().map(|c| c.trim().to_string()).unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).trim().to_string());
                    if !v.is_empty() { out.insert(n.clone(), v); }
                }
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}

/// Plain string scan for `<Data Name="..">..</Data>`, used when the XML reader
/// finds nothing (truncated or otherwise broken payloads).
fn event_data_scan(xml: &str) -> HashMap<String, String> {
    let mut res = HashMap::new();
    let mut rest = xml;
    while let Some(i) = rest.find("<Data Name=\"") {
        let after = &rest[i + 12..];
        let Some(ne) = after.find('"') else { break };
        let name = &after[..ne];
        let Some(gt) = after[ne..].find('>') else { break };
        let val_part = &after[ne + gt + 1..];
        let Some(ve) = val_part.find("</Data>") else { break };
        res.insert(name.to_string(), val_part[..ve].trim().to_string());
        rest = &val_part[ve + 7..];
    }
    res
}
