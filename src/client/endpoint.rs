// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{fmt, path::PathBuf, str::FromStr};

/// Where the daemon listens, parsed from an address such as `unix:///run/buildkit/buildkitd.sock`
/// or `tcp://10.0.0.5:1234`.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// A `host:port` pair, handed to the resolver as-is.
    Tcp(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointError {
    UnsupportedScheme(String),
    MissingScheme,
    MissingPath,
    MissingPort,
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::UnsupportedScheme(scheme) => {
                write!(f, "unsupported scheme \"{scheme}\", expected \"unix\" or \"tcp\"")
            }
            EndpointError::MissingScheme => write!(f, "address has no scheme"),
            EndpointError::MissingPath => write!(f, "unix address has no socket path"),
            EndpointError::MissingPort => write!(f, "tcp address must be of the form host:port"),
        }
    }
}

impl std::error::Error for EndpointError {}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let Some((scheme, rest)) = address.split_once("://") else {
            return Err(EndpointError::MissingScheme);
        };

        match scheme {
            "unix" => {
                if rest.is_empty() {
                    return Err(EndpointError::MissingPath);
                }
                Ok(Endpoint::Unix(PathBuf::from(rest)))
            }
            "tcp" => match rest.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    Ok(Endpoint::Tcp(rest.to_string()))
                }
                _ => Err(EndpointError::MissingPort),
            },
            other => Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
    }
}
