//! Byte-level plumbing between sockets and ways.
//!
//! - **`buffer`**: fixed-capacity buffer and line accumulator owned by a way
//! - **`channel`**: buffer-first reads and the entity pipe shared with
//!   application threads
//! - **`chunked`** / **`sized`**: entity framing codecs
//! - **`transport`**: the non-blocking stream under a connection

pub mod buffer;
pub mod channel;
pub mod chunked;
pub mod sized;
pub mod transport;
