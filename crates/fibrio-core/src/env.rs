//! Environment variable utilities
//!
//! `env_get<T>` parses an environment variable with a default, and
//! `env_key` maps a dotted config name onto the environment key that
//! overrides it.
//!
//! # Usage
//!
//! ```ignore
//! use fibrio_core::env::{env_get, env_get_bool, env_key};
//!
//! let threads: usize = env_get("FIBRIO_THREADS", 4);
//! let use_caller = env_get_bool("FIBRIO_USE_CALLER", false);
//! assert_eq!(env_key("tcp.connect.timeout"), "FIBRIO_TCP_CONNECT_TIMEOUT");
//! ```

use std::str::FromStr;

use crate::constants::ENV_PREFIX;

/// Get environment variable parsed as type T, or return default
///
/// Unset variables and parse failures both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
///
/// Returns `Some(T)` if the variable is set and parses successfully.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Environment key for a dotted config name
///
/// `fiber.stack_size` -> `FIBRIO_FIBER_STACK_SIZE`
pub fn env_key(config_name: &str) -> String {
    let mut key = String::with_capacity(ENV_PREFIX.len() + config_name.len());
    key.push_str(ENV_PREFIX);
    for c in config_name.chars() {
        key.push(match c {
            '.' => '_',
            c => c.to_ascii_uppercase(),
        });
    }
    key
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__FIBRIO_TEST_UNSET_12345__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_bool_default() {
        assert!(env_get_bool("__FIBRIO_TEST_UNSET_12345__", true));
        assert!(!env_get_bool("__FIBRIO_TEST_UNSET_12345__", false));
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<usize> = env_get_opt("__FIBRIO_TEST_UNSET_12345__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__FIBRIO_TEST_NUM__", " 123 ");
        let val: usize = env_get("__FIBRIO_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__FIBRIO_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (raw, expected) in [
            ("1", true),
            ("TRUE", true),
            ("yes", true),
            ("on", true),
            ("0", false),
            ("false", false),
            ("garbage", false),
        ] {
            std::env::set_var("__FIBRIO_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__FIBRIO_TEST_BOOL__", !expected), expected, "{}", raw);
        }
        std::env::remove_var("__FIBRIO_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__FIBRIO_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__FIBRIO_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__FIBRIO_TEST_INVALID__");
    }

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("fiber.stack_size"), "FIBRIO_FIBER_STACK_SIZE");
        assert_eq!(env_key("tcp.connect.timeout"), "FIBRIO_TCP_CONNECT_TIMEOUT");
    }
}
