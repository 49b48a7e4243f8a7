//! Helm values documents: validation (§3), the Compose subset (§3/§4.D) and
//! the polymorphic values source (§4.C).

pub mod compose;
pub mod converter;
pub mod document;
pub mod source;

pub use document::{validate_no_null_values, validate_service_names};
pub use source::ValuesSource;
