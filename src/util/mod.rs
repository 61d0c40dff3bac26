//! Shared helpers for URL handling and text cleanup.
//!
//! - **URLs**: SSRF-safe validation, identity normalization, relative resolution
//! - **Text**: whitespace/quote cleanup, markup stripping, excerpt truncation

mod text;
mod urls;

pub use text::{clean_text, strip_control_chars, strip_markup, truncate_to_width};
pub use urls::{
    is_same_host, normalize_url, resolve_url, validate_url, UrlValidationError,
};
