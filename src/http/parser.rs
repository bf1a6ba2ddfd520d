//! Start-line and header-field grammar.
//!
//! Only what framing needs is interpreted: tokens of the start line and the
//! `name: value` split of header fields.

use crate::error::FramingError;
use crate::http::message::StartLine;
use crate::http::request::{Method, Version};
use crate::http::response::StatusCode;

/// Splits the next space-delimited token off `rest`.
///
/// Returns `None` when the end of the line is reached before a delimiter.
fn next_token<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let (token, tail) = rest.split_once(' ')?;
    *rest = tail;
    Some(token)
}

/// Parses `METHOD SP request-target SP HTTP-version`.
pub fn parse_request_line(line: &str) -> Result<StartLine, FramingError> {
    let short = || FramingError::ShortStartLine(line.to_string());
    let mut rest = line;

    let method = next_token(&mut rest).filter(|t| !t.is_empty()).ok_or_else(short)?;
    let target = next_token(&mut rest).filter(|t| !t.is_empty()).ok_or_else(short)?;
    if rest.is_empty() {
        return Err(short());
    }
    let version = Version::parse(rest).ok_or_else(|| FramingError::InvalidVersion(rest.to_string()))?;

    Ok(StartLine::Request {
        method: Method::parse(method),
        target: target.to_string(),
        version,
    })
}

/// Parses `HTTP-version SP status-code SP reason-phrase`.
///
/// A missing reason phrase (`HTTP/1.1 204`) is tolerated; a missing status
/// code is not.
pub fn parse_status_line(line: &str) -> Result<StartLine, FramingError> {
    let short = || FramingError::ShortStartLine(line.to_string());
    let mut rest = line;

    let version = next_token(&mut rest).ok_or_else(short)?;
    let version = Version::parse(version).ok_or_else(|| FramingError::InvalidVersion(version.to_string()))?;

    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    if code.is_empty() {
        return Err(short());
    }
    let status = code
        .parse::<u16>()
        .ok()
        .filter(|c| (100..1000).contains(c))
        .ok_or_else(|| FramingError::InvalidStatus(code.to_string()))?;

    Ok(StartLine::Status {
        version,
        status: StatusCode(status),
        reason: reason.to_string(),
    })
}

/// Splits `name ":" OWS value OWS`.
pub fn parse_header_line(line: &str) -> Result<(String, String), FramingError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| FramingError::InvalidHeader(line.to_string()))?;

    if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
        return Err(FramingError::InvalidHeader(line.to_string()));
    }

    Ok((name.to_string(), value.trim().to_string()))
}

/// Whether a header line continues the previous field (obsolete folding).
pub fn is_continuation(line: &str) -> bool {
    line.starts_with([' ', '\t'])
}

/// Parses a `Content-Length` value.
pub fn parse_content_length(value: &str) -> Result<u64, FramingError> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FramingError::InvalidContentLength(value.to_string()));
    }
    value
        .parse()
        .map_err(|_| FramingError::InvalidContentLength(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let start = parse_request_line("GET /x HTTP/1.1").unwrap();
        assert_eq!(
            start,
            StartLine::Request {
                method: Method::GET,
                target: "/x".into(),
                version: Version::HTTP_11,
            }
        );
    }

    #[test]
    fn request_line_without_version_is_short() {
        assert!(matches!(
            parse_request_line("GET /x"),
            Err(FramingError::ShortStartLine(_))
        ));
        assert!(matches!(
            parse_request_line("GET /x "),
            Err(FramingError::ShortStartLine(_))
        ));
    }

    #[test]
    fn status_line_keeps_spaces_in_reason() {
        let start = parse_status_line("HTTP/1.0 404 Not Found").unwrap();
        assert_eq!(
            start,
            StartLine::Status {
                version: Version::HTTP_10,
                status: StatusCode::NOT_FOUND,
                reason: "Not Found".into(),
            }
        );
    }

    #[test]
    fn non_numeric_status_is_rejected() {
        assert!(matches!(
            parse_status_line("HTTP/1.1 2OO OK"),
            Err(FramingError::InvalidStatus(_))
        ));
    }

    #[test]
    fn header_value_is_trimmed() {
        assert_eq!(
            parse_header_line("Host:   example.com  ").unwrap(),
            ("Host".to_string(), "example.com".to_string())
        );
        assert!(parse_header_line("Broken Header: x").is_err());
    }

    #[test]
    fn content_length_rejects_signs() {
        assert_eq!(parse_content_length("42").unwrap(), 42);
        assert!(parse_content_length("-1").is_err());
        assert!(parse_content_length("").is_err());
    }
}
