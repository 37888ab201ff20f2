//! Common utilities and types

pub mod base64;
pub mod error;

pub use error::{BinaryError, DecodeError, Error, FetchError, Result, StartError};
