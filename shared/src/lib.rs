//! kubetap shared library
//!
//! Wire types, request encoding and errors shared by the kubetap client and
//! the loopback relay.

pub mod encode;
pub mod error;
pub mod frame;
pub mod protocol;

pub use encode::encode_query;
pub use error::{Error, ErrorClass, Result};
