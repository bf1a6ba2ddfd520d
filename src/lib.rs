//! nioway - non-blocking HTTP/1.1 connection engine
//!
//! A readiness-driven reactor multiplexes client and server HTTP exchanges
//! over a few threads:
//!
//! - **`reactor`**: the poll loop, readiness registrations and the helper seam
//! - **`connection`**: one socket conversation and the connection pool
//! - **`way`**: per-direction message state machines and client/server roles
//! - **`io`**: buffers, entity codecs and transports
//! - **`http`**: the message model, parsing and serialization
//! - **`helper`**: client and server connectors

pub mod config;
pub mod connection;
pub mod error;
pub mod helper;
pub mod http;
pub mod io;
pub mod reactor;
pub mod way;

pub use config::Config;
pub use error::{ConnectorError, FramingError};
pub use helper::{ClientConnector, Handler, Server};
pub use http::entity::Entity;
pub use http::headers::Headers;
pub use http::request::{Method, Request, Version};
pub use http::response::{Response, StatusCode};
