use std::fmt;

use bytes::Bytes;

use crate::http::entity::Entity;
use crate::http::headers::Headers;
use crate::http::request::Version;

/// Numeric status of a response.
///
/// Besides the HTTP codes, the 1000 range carries connector statuses: they
/// never travel on the wire and describe why no real response is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const RESET_CONTENT: StatusCode = StatusCode(205);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    /// The connection could not be established.
    pub const CONNECTOR_ERROR_CONNECTION: StatusCode = StatusCode(1000);
    /// The exchange failed after the connection was established.
    pub const CONNECTOR_ERROR_COMMUNICATION: StatusCode = StatusCode(1001);
    /// The connector itself failed, including timeouts.
    pub const CONNECTOR_ERROR_INTERNAL: StatusCode = StatusCode(1002);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// 1xx statuses announce that the final response is still to come.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_connector_error(&self) -> bool {
        self.0 >= 1000
    }

    /// Whether a response with this status is forbidden to carry an entity.
    pub fn forbids_entity(&self) -> bool {
        self.is_informational() || matches!(self.0, 204 | 205 | 304)
    }

    /// Returns the standard reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use nioway::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::NOT_FOUND.reason_phrase(), "Not Found");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            1000 => "Connection Error",
            1001 => "Communication Error",
            1002 => "Internal Connector Error",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// An HTTP response, either produced by a server handler or delivered to a
/// client caller.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    /// Reason phrase as received; `None` means the standard phrase
    pub reason: Option<String>,
    pub version: Version,
    pub headers: Headers,
    pub entity: Entity,
    /// Details attached to connector statuses
    pub description: Option<String>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: Headers::new(),
            entity: Entity::Empty,
            description: None,
        }
    }

    /// Creates a simple 200 OK response with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK).with_entity(Entity::Bytes(body.into()))
    }

    /// Creates a 404 Not Found response.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND).with_entity(Entity::from_static(b"404 Not Found"))
    }

    /// Creates a 500 Internal Server Error response.
    pub fn internal_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
            .with_entity(Entity::from_static(b"500 Internal Server Error"))
    }

    /// A connector status explaining why no response came back.
    pub fn error(status: StatusCode, description: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.description = Some(description.into());
        response
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entity = entity;
        self
    }

    pub fn reason_phrase(&self) -> &str {
        self.reason.as_deref().unwrap_or_else(|| self.status.reason_phrase())
    }
}
