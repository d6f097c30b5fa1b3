//! Meridian demo service and its generated-style bindings.

pub mod echo;
