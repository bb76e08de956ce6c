//! Environment and time helpers.

pub mod env;

pub use env::{get_env_parsed, get_env_with_prefix, unix_now};
