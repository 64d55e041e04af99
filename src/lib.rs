// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod client;
pub mod commands;
pub mod config;
pub mod protocol;
pub mod test_env;
pub mod tls;

/// The address of the build daemon when neither `--addr` nor `BUILDKIT_HOST` is given.
pub const DEFAULT_ADDRESS: &str = "unix:///run/buildkit/buildkitd.sock";

/// Gets the daemon address that `--addr` should default to.
///
/// `BUILDKIT_HOST` is read exactly once, by the caller of this function, before the command line
/// is parsed. An empty value is treated the same as an unset one.
pub fn default_address(buildkit_host: Option<String>) -> String {
    match buildkit_host {
        Some(addr) if !addr.is_empty() => addr,
        _ => DEFAULT_ADDRESS.to_string(),
    }
}

/// Reads `BUILDKIT_HOST` from the process environment.
pub fn buildkit_host() -> Option<String> {
    std::env::var("BUILDKIT_HOST").ok()
}

/// The environment variable used to override the log filter.
pub const LOG_ENV: &str = "BUILDCTL_LOG";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_address_falls_back() {
        assert_eq!(default_address(None), DEFAULT_ADDRESS);
        assert_eq!(default_address(Some(String::new())), DEFAULT_ADDRESS);
    }

    #[test]
    fn default_address_from_env() {
        assert_eq!(
            default_address(Some("unix:///tmp/x".to_string())),
            "unix:///tmp/x"
        );
    }
}
