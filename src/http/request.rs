use std::fmt;

use url::Url;

use crate::http::entity::Entity;
use crate::http::headers::Headers;

/// HTTP request methods.
///
/// Methods outside the registered set are carried verbatim as
/// `Extension` so the connector can frame them like any other request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// TRACE - Loop back the request
    TRACE,
    /// CONNECT - Open a tunnel
    CONNECT,
    /// Any other token
    Extension(String),
}

impl Method {
    /// Parses an HTTP method token (case-sensitive).
    ///
    /// # Example
    ///
    /// ```
    /// # use nioway::http::request::Method;
    /// assert_eq!(Method::parse("GET"), Method::GET);
    /// assert_eq!(Method::parse("PURGE"), Method::Extension("PURGE".into()));
    /// ```
    pub fn parse(s: &str) -> Self {
        match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            "TRACE" => Method::TRACE,
            "CONNECT" => Method::CONNECT,
            other => Method::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::TRACE => "TRACE",
            Method::CONNECT => "CONNECT",
            Method::Extension(s) => s,
        }
    }

    /// Whether a request with this method may be replayed or pipelined
    /// behind other requests without changing its effect.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version of a start line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };

    /// Parses `HTTP/<major>.<minor>`.
    pub fn parse(s: &str) -> Option<Self> {
        let digits = s.strip_prefix("HTTP/")?;
        let (major, minor) = digits.split_once('.')?;
        Some(Version {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// HTTP/1.1 and later keep connections open unless told otherwise.
    pub fn persistent_by_default(&self) -> bool {
        *self >= Version::HTTP_11
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::HTTP_11
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// An HTTP request, either received by a server connector or submitted to a
/// client connector.
#[derive(Debug)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request-target exactly as it appears on the request line
    pub target: String,
    /// Absolute reference of the target; required by client connectors to
    /// find the host to talk to
    pub url: Option<Url>,
    pub version: Version,
    pub headers: Headers,
    pub entity: Entity,
}

impl Request {
    /// Builds a client request for an absolute URL. The request-target is
    /// the URL's path and query.
    pub fn new(method: Method, url: Url) -> Self {
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        Self {
            method,
            target,
            url: Some(url),
            version: Version::HTTP_11,
            headers: Headers::new(),
            entity: Entity::Empty,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entity = entity;
        self
    }

    /// Whether the peer asked for the connection to be closed after this
    /// exchange.
    ///
    /// `Connection: close` always wins; HTTP/1.0 closes unless
    /// `Connection: keep-alive` is present.
    pub fn wants_close(&self) -> bool {
        wants_close(self.version, &self.headers)
    }
}

pub(crate) fn wants_close(version: Version, headers: &Headers) -> bool {
    if headers.has_token("Connection", "close") {
        true
    } else if version.persistent_by_default() {
        false
    } else {
        !headers.has_token("Connection", "keep-alive")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_keeps_query() {
        let url = Url::parse("http://example.com:8080/search?q=rust").unwrap();
        let request = Request::new(Method::GET, url);
        assert_eq!(request.target, "/search?q=rust");
    }

    #[test]
    fn http_10_closes_without_keep_alive() {
        let mut headers = Headers::new();
        assert!(wants_close(Version::HTTP_10, &headers));
        headers.add("Connection", "Keep-Alive");
        assert!(!wants_close(Version::HTTP_10, &headers));
    }

    #[test]
    fn version_round_trips_through_display() {
        assert_eq!(Version::parse("HTTP/1.0"), Some(Version::HTTP_10));
        assert_eq!(Version::HTTP_11.to_string(), "HTTP/1.1");
        assert_eq!(Version::parse("HTTP/x"), None);
    }
}
