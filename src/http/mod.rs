//! HTTP message model.
//!
//! The connector interprets HTTP only as far as framing requires:
//!
//! - **`message`**: start lines and message heads shared by both directions
//! - **`parser`**: request-line, status-line and header-field grammar
//! - **`writer`**: serialization of start lines and header sections
//! - **`headers`**: ordered, case-insensitive header series
//! - **`request`** / **`response`**: what applications submit and receive
//! - **`entity`**: message bodies, in memory or streamed

pub mod entity;
pub mod headers;
pub mod message;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
