// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use crate::commands::Cli;

/// A snapshot of the global command line settings, taken once right after the arguments are
/// parsed. Every subcommand receives a shared reference to the same `GlobalConfig`; nothing
/// modifies it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub debug: bool,
    pub address: String,
    pub server_name: String,
    pub ca_cert: String,
    pub cert: String,
    pub key: String,
    pub timeout: Option<Duration>,
}

impl From<&Cli> for GlobalConfig {
    fn from(cli: &Cli) -> Self {
        GlobalConfig {
            debug: cli.debug,
            address: cli.addr.clone(),
            server_name: cli.server_name.clone(),
            ca_cert: cli.ca_cert.clone(),
            cert: cli.cert.clone(),
            key: cli.key.clone(),
            timeout: cli.timeout.map(Duration::from_secs),
        }
    }
}

impl GlobalConfig {
    /// The TLS material the client should use, if any. See `resolve_credentials()`.
    pub fn credentials(&self) -> Option<TransportCredentials> {
        resolve_credentials(&self.server_name, &self.ca_cert, &self.cert, &self.key)
    }

    /// Whether any of `--ca-cert`, `--cert` or `--key` was given.
    pub fn has_tls_paths(&self) -> bool {
        !self.ca_cert.is_empty() || !self.cert.is_empty() || !self.key.is_empty()
    }
}

/// Mutual TLS material for the daemon connection. The fields are paths, exactly as given on the
/// command line; nothing is read from disk until the client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCredentials {
    /// Name the daemon's certificate is validated against.
    pub server_name: String,
    pub ca_cert: String,
    pub cert: String,
    pub key: String,
}

/// Turn the four credential flags into a `TransportCredentials`.
///
/// The server name is the only field that decides whether TLS is configured: when it is empty the
/// other three values are dropped, even if they are set.
pub fn resolve_credentials(
    server_name: &str,
    ca_cert: &str,
    cert: &str,
    key: &str,
) -> Option<TransportCredentials> {
    if server_name.is_empty() {
        return None;
    }

    Some(TransportCredentials {
        server_name: server_name.to_string(),
        ca_cert: ca_cert.to_string(),
        cert: cert.to_string(),
        key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_server_name_means_no_credentials() {
        assert_eq!(resolve_credentials("", "", "", ""), None);
        assert_eq!(resolve_credentials("", "ca.pem", "", ""), None);
        assert_eq!(resolve_credentials("", "ca.pem", "cert.pem", "key.pem"), None);
    }

    #[test]
    fn server_name_carries_all_fields() {
        let creds = resolve_credentials("buildkitd", "ca.pem", "cert.pem", "key.pem").unwrap();
        assert_eq!(
            creds,
            TransportCredentials {
                server_name: "buildkitd".to_string(),
                ca_cert: "ca.pem".to_string(),
                cert: "cert.pem".to_string(),
                key: "key.pem".to_string(),
            }
        );

        // Empty companion fields are passed through untouched.
        let creds = resolve_credentials("buildkitd", "", "", "").unwrap();
        assert_eq!(creds.ca_cert, "");
        assert_eq!(creds.cert, "");
        assert_eq!(creds.key, "");
    }

    #[test]
    fn ignored_tls_paths_are_detectable() {
        let config = |args: &[&str]| {
            let argv = std::iter::once("buildctl").chain(args.iter().copied());
            GlobalConfig::from(&Cli::try_parse_with_host(argv, None).unwrap())
        };

        let cfg = config(&["du"]);
        assert!(!cfg.has_tls_paths());
        assert_eq!(cfg.credentials(), None);

        let cfg = config(&["--key", "key.pem", "du"]);
        assert!(cfg.has_tls_paths());
        assert_eq!(cfg.credentials(), None);

        let cfg = config(&["--server-name", "buildkitd", "--ca-cert", "ca.pem", "du"]);
        assert!(cfg.has_tls_paths());
        assert!(cfg.credentials().is_some());
    }

    #[test]
    fn resolution_is_repeatable() {
        let first = resolve_credentials("buildkitd", "ca.pem", "", "key.pem");
        let second = resolve_credentials("buildkitd", "ca.pem", "", "key.pem");
        assert_eq!(first, second);
    }
}
