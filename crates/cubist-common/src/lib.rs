//! Common utilities for cubist
//!
//! This crate provides shared functionality used across all cubist crates:
//! the HTTP method/status vocabulary spoken by the transport, and the
//! case- and space-insensitive name rules every cube object name follows.

pub mod http;
pub mod names;

pub use http::{HttpMethod, HttpStatus};
pub use names::{names_equal, normalize_name, NameKey};
