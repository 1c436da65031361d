use std::ptr;
use windows_sys::Win32::System::EventLog::*;
use windows_sys::Win32::Foundation::GetLastError;
use crate::resolver::{FormatError, MessageFormatter};
use crate::source::{EventSource, SourceError, Window};

const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
const ERROR_NO_MORE_ITEMS: u32 = 259;

/// Any `EVT_HANDLE`: query sessions, events and publisher metadata. Closed on drop.
pub struct Handle(EVT_HANDLE);
impl Drop for Handle { fn drop(&mut self) { if self.0 != 0 { unsafe { EvtClose(self.0); } } } }

fn w(s: &str) -> Vec<u16> { let mut v = s.encode_utf16().collect::<Vec<u16>>(); v.push(0); v }

fn last_error() -> u32 { unsafe { GetLastError() } }

/// The live Windows Event Log, queried newest first.
pub struct WinEventSource;

impl EventSource for WinEventSource {
    type Session = Handle;
    type Event = Handle;

    fn open(&self, channel: &str, window: Window) -> Result<Handle, SourceError> {
        let path = w(channel);
        let query = w(&window.xpath());
        let flags = (EvtQueryChannelPath | EvtQueryReverseDirection) as u32;
        let h = unsafe { EvtQuery(0, path.as_ptr(), query.as_ptr(), flags) };
        if h == 0 {
            let code = last_error();
            let reason = if code == 5 { "access denied (run as Administrator)".to_string() } else { format!("EvtQuery error {}", code) };
            return Err(SourceError::Open { channel: channel.to_string(), reason });
        }
        Ok(Handle(h))
    }

    fn next_page(&self, session: &mut Handle, page_size: usize) -> Result<Vec<Handle>, SourceError> {
        let mut arr: Vec<EVT_HANDLE> = vec![0; page_size];
        let mut returned: u32 = 0;
        let ok = unsafe { EvtNext(session.0, arr.len() as u32, arr.as_mut_ptr(), u32::MAX, 0, &mut returned) };
        if ok == 0 {
            let code = last_error();
            if code == ERROR_NO_MORE_ITEMS { return Ok(Vec::new()); }
            return Err(SourceError::Page(format!("EvtNext error {}", code)));
        }
        Ok(arr.into_iter().take(returned as usize).map(Handle).collect())
    }

    fn render(&self, event: &Handle) -> Result<String, SourceError> {
        let mut used: u32 = 0;
        let mut count: u32 = 0;
        let flags = EvtRenderEventXml as u32;
        let ok = unsafe { EvtRender(0, event.0, flags, 0, ptr::null_mut(), &mut used, &mut count) };
        if ok != 0 || used == 0 { return Err(SourceError::Render("EvtRender returned no data".to_string())); }
        let code = last_error();
        if code != ERROR_INSUFFICIENT_BUFFER { return Err(SourceError::Render(format!("EvtRender error {}", code))); }
        let mut buf: Vec<u16> = vec![0u16; (used as usize).div_ceil(2)];
        if unsafe { EvtRender(0, event.0, flags, used, buf.as_mut_ptr() as *mut _, &mut used, &mut count) } == 0 {
            return Err(SourceError::Render(format!("EvtRender error {}", last_error())));
        }
        Ok(String::from_utf16_lossy(&buf).trim_matches(char::from(0)).to_string())
    }
}

/// Formats messages through the publisher's registered message resources.
pub struct WinMessageFormatter;

impl MessageFormatter<Handle> for WinMessageFormatter {
    type Metadata = Handle;

    fn open_metadata(&self, provider: &str) -> Result<Handle, FormatError> {
        let name = w(provider);
        let h = unsafe { EvtOpenPublisherMetadata(0, name.as_ptr(), ptr::null(), 0, 0) };
        if h == 0 {
            return Err(FormatError::Metadata { provider: provider.to_string(), reason: format!("EvtOpenPublisherMetadata error {}", last_error()) });
        }
        Ok(Handle(h))
    }

    fn format_message(&self, metadata: &Handle, event: &Handle) -> Result<String, FormatError> {
        let flags = EvtFormatMessageEvent as u32;
        let mut used: u32 = 0;
        let ok = unsafe { EvtFormatMessage(metadata.0, event.0, 0, 0, ptr::null(), flags, 0, ptr::null_mut(), &mut used) };
        if ok != 0 || used == 0 { return Err(FormatError::Format("EvtFormatMessage returned no text".to_string())); }
        let code = last_error();
        if code != ERROR_INSUFFICIENT_BUFFER { return Err(FormatError::Format(format!("EvtFormatMessage error {}", code))); }
        let mut buf: Vec<u16> = vec![0u16; used as usize];
        if unsafe { EvtFormatMessage(metadata.0, event.0, 0, 0, ptr::null(), flags, used, buf.as_mut_ptr(), &mut used) } == 0 {
            return Err(FormatError::Format(format!("EvtFormatMessage error {}", last_error())));
        }
        Ok(String::from_utf16_lossy(&buf).trim_matches(char::from(0)).to_string())
    }
}
