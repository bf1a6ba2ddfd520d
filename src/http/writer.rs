use bytes::{BufMut, BytesMut};

use crate::http::headers::Headers;
use crate::http::message::StartLine;

pub const CRLF: &[u8] = b"\r\n";

/// Appends the start line, CRLF included.
pub fn write_start_line(start: &StartLine, out: &mut BytesMut) {
    let line = match start {
        StartLine::Request {
            method,
            target,
            version,
        } => format!("{} {} {}", method, target, version),
        StartLine::Status {
            version,
            status,
            reason,
        } => format!("{} {} {}", version, status.as_u16(), reason),
    };
    out.put_slice(line.as_bytes());
    out.put_slice(CRLF);
}

/// Appends every field followed by the empty line closing the section.
pub fn write_headers(headers: &Headers, out: &mut BytesMut) {
    for (name, value) in headers.iter() {
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(CRLF);
    }
    out.put_slice(CRLF);
}
