use crate::http::headers::Headers;
use crate::http::request::{Method, Version};
use crate::http::response::StatusCode;

/// First line of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: Method,
        target: String,
        version: Version,
    },
    Status {
        version: Version,
        status: StatusCode,
        reason: String,
    },
}

impl StartLine {
    pub fn version(&self) -> Version {
        match self {
            StartLine::Request { version, .. } | StartLine::Status { version, .. } => *version,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            StartLine::Status { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&Method> {
        match self {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Status { .. } => None,
        }
    }
}

/// Start line plus header section: everything a way needs to frame a
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub start: StartLine,
    pub headers: Headers,
}

impl MessageHead {
    pub fn new(start: StartLine) -> Self {
        Self {
            start,
            headers: Headers::new(),
        }
    }

    pub fn is_informational(&self) -> bool {
        self.start.status().is_some_and(|s| s.is_informational())
    }
}
