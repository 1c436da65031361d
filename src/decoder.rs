//! Offline message templates for well-known providers.
//!
//! Exported `.evtx` files carry no message DLLs, so the "publisher metadata"
//! for a provider is its entry in this table. Providers that are not listed
//! have no metadata; listed providers fail to format events they have no
//! template for.

use std::collections::HashMap;
use crate::event_xml::event_data;
use crate::evtx_source::EvtxEvent;
use crate::parser::parse_record;
use crate::resolver::{FormatError, MessageFormatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KnownProvider {
    ServiceControlManager,
    Disk,
    Ntfs,
    KernelPower,
    EventLog,
    WheaLogger,
    DnsClient,
    Display,
    DistributedCom,
    Schannel,
    WerSystemErrorReporting,
    Volsnap,
}

impl KnownProvider {
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "Service Control Manager" => KnownProvider::ServiceControlManager,
            "Disk" => KnownProvider::Disk,
            "Ntfs" | "Microsoft-Windows-Ntfs" => KnownProvider::Ntfs,
            "Microsoft-Windows-Kernel-Power" => KnownProvider::KernelPower,
            "EventLog" => KnownProvider::EventLog,
            "Microsoft-Windows-WHEA-Logger" => KnownProvider::WheaLogger,
            "Microsoft-Windows-DNS-Client" => KnownProvider::DnsClient,
            "Display" => KnownProvider::Display,
            "DistributedCOM" | "Microsoft-Windows-DistributedCOM" => KnownProvider::DistributedCom,
            "Schannel" => KnownProvider::Schannel,
            "Microsoft-Windows-WER-SystemErrorReporting" => KnownProvider::WerSystemErrorReporting,
            "volsnap" => KnownProvider::Volsnap,
            _ => return None,
        })
    }
}

fn first<'a>(m: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| m.get(*k)).map(String::as_str).filter(|v| !v.is_empty())
}

pub fn decode(provider: KnownProvider, event_id: u32, m: &HashMap<String, String>) -> Option<String> {
    use KnownProvider::*;
    match provider {
        ServiceControlManager => {
            let svc = first(m, &["ServiceName", "param1"]).unwrap_or("");
            let what = match event_id {
                7000 => "Service failed to start",
                7001 => "Service dependency failed to start",
                7009 => "Service start timed out",
                7011 => "Service hung or a timeout occurred",
                7023 => "Service terminated with error",
                7031 | 7034 => "Service terminated unexpectedly",
                _ if !svc.is_empty() => return Some(format!("Service Control Manager event {}: {}", event_id, svc)),
                _ => return None,
            };
            Some(format!("{}: {}", what, svc))
        }
        Disk => {
            let dev = first(m, &["DeviceName", "param1"]);
            match (event_id, dev) {
                (7, Some(d)) => Some(format!("Bad block detected on {}", d)),
                (11, Some(d)) => Some(format!("Disk or controller error on {}", d)),
                (51, _) => Some("Paging I/O error; the storage path is unstable".to_string()),
                (157, Some(d)) => Some(format!("Disk was surprise removed: {}", d)),
                (_, Some(d)) => Some(format!("Disk event {} on {}", event_id, d)),
                _ => None,
            }
        }
        Ntfs => match event_id {
            55 => Some("File system corruption detected (NTFS)".to_string()),
            57 => Some("Delayed write failed (NTFS)".to_string()),
            140 => Some("Failed to flush data to the transaction log (NTFS)".to_string()),
            _ => None,
        },
        KernelPower => (event_id == 41).then(|| "The system rebooted without cleanly shutting down first".to_string()),
        EventLog => (event_id == 6008).then(|| "The previous system shutdown was unexpected".to_string()),
        WheaLogger => match event_id {
            17 => Some(format!("Corrected hardware error ({})", first(m, &["Component", "DeviceId"]).unwrap_or("unknown component"))),
            18 => {
                let src = first(m, &["ErrorSource"]).unwrap_or("unknown source");
                match first(m, &["ApicId", "ProcessorAPICID"]) {
                    Some(apic) => Some(format!("Fatal hardware error ({} APIC {})", src, apic)),
                    None => Some(format!("Fatal hardware error ({})", src)),
                }
            }
            19 | 20 => Some(format!("Hardware error reported by WHEA ({})", first(m, &["ErrorSource"]).unwrap_or("unknown source"))),
            _ => None,
        },
        DnsClient => (event_id == 1014).then(|| match first(m, &["QueryName"]) {
            Some(q) => format!("Name resolution timed out: {}", q),
            None => "Name resolution timed out".to_string(),
        }),
        Display => (event_id == 4101).then(|| "Display driver stopped responding and has recovered".to_string()),
        DistributedCom => {
            let clsid = first(m, &["CLSID", "param4"]);
            let appid = first(m, &["APPID", "param5"]);
            if clsid.is_none() && appid.is_none() { return None; }
            Some(format!("DCOM permission error CLSID={} APPID={}", clsid.unwrap_or("-"), appid.unwrap_or("-")))
        }
        Schannel => first(m, &["ErrorCode", "AlertDesc"]).map(|c| format!("TLS error (code {})", c)),
        WerSystemErrorReporting => first(m, &["BugcheckCode", "param1"]).map(|b| format!("The computer rebooted from a bugcheck: {}", b)),
        Volsnap => (event_id == 25 || event_id == 36).then(|| "Shadow copies were aborted; check the underlying disk".to_string()),
    }
}

/// [`MessageFormatter`] for events read from `.evtx` files.
pub struct DecoderFormatter;

impl MessageFormatter<EvtxEvent> for DecoderFormatter {
    type Metadata = KnownProvider;

    fn open_metadata(&self, provider: &str) -> Result<KnownProvider, FormatError> {
        KnownProvider::lookup(provider).ok_or_else(|| FormatError::Metadata { provider: provider.to_string(), reason: "no built-in message table".to_string() })
    }

    fn format_message(&self, provider: &KnownProvider, event: &EvtxEvent) -> Result<String, FormatError> {
        let event_id = parse_record(&event.xml).map_err(|e| FormatError::Format(e.to_string()))?.event_id;
        decode(*provider, event_id, &event_data(&event.xml))
            .ok_or_else(|| FormatError::Format(format!("no template for {:?} event {}", provider, event_id)))
    }
}
