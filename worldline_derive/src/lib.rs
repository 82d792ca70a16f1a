//! Derive macros for the worldline crate.
//!
//! Provides:
//! - `#[derive(Error)]` - display/error boilerplate for error types
//! - `#[derive(PlainValue)]` - canonical dictionary codec for plain types

mod error;
mod plain_value;

use proc_macro::TokenStream;

/// Implements `Display` and `std::error::Error` from `#[error("...")]` attributes.
#[proc_macro_derive(Error, attributes(error))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::derive_error(input)
}

/// Implements `PlainValue`, mapping named fields onto a canonical dictionary.
#[proc_macro_derive(PlainValue)]
pub fn derive_plain_value(input: TokenStream) -> TokenStream {
    plain_value::derive_plain_value(input)
}
