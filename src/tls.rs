// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{fmt, fs::File, io, io::BufReader, sync::Arc};

use {
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, ServerName},
        ClientConfig, RootCertStore,
    },
    tokio_rustls::TlsConnector,
};

use crate::config::TransportCredentials;

/// Failure to turn `TransportCredentials` into a usable TLS client configuration.
#[derive(Debug)]
pub enum TlsError {
    /// A certificate or key file could not be read.
    Read { path: String, source: io::Error },

    /// The file was readable but held nothing usable of the expected kind.
    Empty { path: String, what: &'static str },

    /// A client certificate was given without a key, or the other way around.
    IncompleteKeyPair,

    InvalidServerName(String),

    /// rustls rejected the material, e.g. a key that does not match its certificate.
    Config(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Read { path, source } => write!(f, "could not read \"{path}\": {source}"),
            TlsError::Empty { path, what } => write!(f, "no {what} found in \"{path}\""),
            TlsError::IncompleteKeyPair => {
                write!(f, "client certificate and key must be given together")
            }
            TlsError::InvalidServerName(name) => write!(f, "invalid server name \"{name}\""),
            TlsError::Config(e) => write!(f, "invalid TLS configuration: {e}"),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Read { source, .. } => Some(source),
            TlsError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Config(e)
    }
}

/// Read every PEM certificate in `path`.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let read_err = |source| TlsError::Read {
        path: path.to_string(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(read_err)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(read_err)?;

    if certs.is_empty() {
        return Err(TlsError::Empty {
            path: path.to_string(),
            what: "certificates",
        });
    }
    Ok(certs)
}

/// Read the first PEM private key in `path`.
pub fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let read_err = |source| TlsError::Read {
        path: path.to_string(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(read_err)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(read_err)?
        .ok_or_else(|| TlsError::Empty {
            path: path.to_string(),
            what: "private key",
        })
}

/// Build the client side of a mutual TLS session from the paths in `creds`.
///
/// The CA certificate is always required. The client certificate and key are optional, but if
/// either one is given, both must be.
pub fn get_connector(
    creds: &TransportCredentials,
) -> Result<(TlsConnector, ServerName<'static>), TlsError> {
    let server_name = ServerName::try_from(creds.server_name.as_str())
        .map_err(|_| TlsError::InvalidServerName(creds.server_name.clone()))?
        .to_owned();

    let mut roots = RootCertStore::empty();
    for cert in load_certs(&creds.ca_cert)? {
        roots.add(cert)?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (creds.cert.is_empty(), creds.key.is_empty()) {
        (true, true) => builder.with_no_client_auth(),
        (false, false) => {
            builder.with_client_auth_cert(load_certs(&creds.cert)?, load_key(&creds.key)?)?
        }
        _ => return Err(TlsError::IncompleteKeyPair),
    };

    Ok((TlsConnector::from(Arc::new(config)), server_name))
}
