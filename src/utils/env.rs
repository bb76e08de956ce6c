/// Get environment variable with PLANSYNC_ prefix, falling back to unprefixed version
///
/// Checks `PLANSYNC_{key}` first, then `{key}`, so platform-provided
/// variables such as `PORT` keep working.
///
/// ```rust,ignore
/// use plansync::utils::get_env_with_prefix;
///
/// // Checks PLANSYNC_PORT first, then PORT
/// let port = get_env_with_prefix("PORT");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("PLANSYNC_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Like [`get_env_with_prefix`], parsed into `T`. Unparseable values are ignored.
pub fn get_env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    get_env_with_prefix(key).and_then(|value| value.trim().parse().ok())
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_with_prefix() {
        unsafe {
            std::env::set_var("PLANSYNC_TEST_VAR", "prefixed_value");
        }
        assert_eq!(get_env_with_prefix("TEST_VAR"), Some("prefixed_value".to_string()));
        unsafe {
            std::env::remove_var("PLANSYNC_TEST_VAR");
        }

        unsafe {
            std::env::set_var("FALLBACK_ONLY_VAR_X", "unprefixed_value");
        }
        assert_eq!(
            get_env_with_prefix("FALLBACK_ONLY_VAR_X"),
            Some("unprefixed_value".to_string())
        );
        unsafe {
            std::env::remove_var("FALLBACK_ONLY_VAR_X");
        }

        assert_eq!(get_env_with_prefix("NON_EXISTENT_VAR"), None);
    }

    #[test]
    fn test_get_env_parsed() {
        unsafe {
            std::env::set_var("PLANSYNC_PARSED_RETRIES", " 7 ");
            std::env::set_var("PLANSYNC_PARSED_GARBAGE", "seven");
        }
        assert_eq!(get_env_parsed::<u32>("PARSED_RETRIES"), Some(7));
        assert_eq!(get_env_parsed::<u32>("PARSED_GARBAGE"), None);
        unsafe {
            std::env::remove_var("PLANSYNC_PARSED_RETRIES");
            std::env::remove_var("PLANSYNC_PARSED_GARBAGE");
        }
    }
}
