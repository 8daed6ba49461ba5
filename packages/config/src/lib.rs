// ABOUTME: Typed access to Codebox environment configuration
// ABOUTME: Parse helpers log malformed values and fall back to the caller's default

pub mod constants;

use std::str::FromStr;
use tracing::warn;

/// Read `name` and parse it, returning `default` when unset or malformed.
pub fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => parse_or(name, &raw, default),
        Err(_) => default,
    }
}

/// Read `name` as a non-empty string.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(name: &str, raw: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring invalid value for {}: {:?} ({})", name, raw, e);
            default
        }
    }
}
