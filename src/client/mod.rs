// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, fmt, io, time::Duration};

use {
    bytes::Bytes,
    futures::SinkExt,
    log::debug,
    rustls::pki_types::ServerName,
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_rustls::TlsConnector,
    tokio_util::codec::{Framed, LengthDelimitedCodec},
};

use crate::{
    config::TransportCredentials,
    protocol::{self, Request, Response, SolveRequest, StatusEvent, UsageRecord, WorkerRecord},
    tls::{self, TlsError},
};

pub mod endpoint;

pub use endpoint::{Endpoint, EndpointError};

/// Any byte stream the client can speak the daemon protocol over: plain TCP, a unix socket, or
/// either one wrapped in TLS.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type Transport = Framed<Box<dyn Io>, LengthDelimitedCodec>;

/// Modifiers accepted by `Client::new()`. They are applied in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOpt {
    /// Connect inside `Client::new()` instead of on the first request.
    WithBlock,

    /// Use mutual TLS with the given material.
    WithCredentials(TransportCredentials),

    /// Give up on connecting (dial plus TLS handshake) after this long.
    WithTimeout(Duration),
}

/// Any failure to reach the daemon. Callers treat this as a single opaque error; the variants
/// only exist so that the message can say what went wrong.
#[derive(Debug)]
pub enum ConnectionError {
    InvalidAddress {
        address: String,
        source: EndpointError,
    },
    Credentials(TlsError),
    Dial {
        address: String,
        source: io::Error,
    },
    Handshake {
        server_name: String,
        source: io::Error,
    },
    /// The connection was established, but the daemon turned the client away.
    Rejected { address: String, reason: String },
    TimedOut { address: String, after: Duration },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::InvalidAddress { address, source } => {
                write!(f, "invalid daemon address \"{address}\": {source}")
            }
            ConnectionError::Credentials(e) => write!(f, "failed to load credentials: {e}"),
            ConnectionError::Dial { address, source } => {
                write!(f, "failed to dial {address}: {source}")
            }
            ConnectionError::Handshake {
                server_name,
                source,
            } => write!(f, "TLS handshake with \"{server_name}\" failed: {source}"),
            ConnectionError::Rejected { address, reason } => {
                write!(f, "daemon at {address} rejected the connection: {reason}")
            }
            ConnectionError::TimedOut { address, after } => {
                write!(f, "timed out after {after:?} connecting to {address}")
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::InvalidAddress { source, .. } => Some(source),
            ConnectionError::Credentials(e) => Some(e),
            ConnectionError::Dial { source, .. } => Some(source),
            ConnectionError::Handshake { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<TlsError> for ConnectionError {
    fn from(e: TlsError) -> Self {
        ConnectionError::Credentials(e)
    }
}

/// Failure of a request made over an established (or lazily establishable) connection.
#[derive(Debug)]
pub enum RequestError {
    /// The deferred dial of a client created without `WithBlock` failed.
    Connection(ConnectionError),

    /// The connection broke while sending or receiving.
    Io(io::Error),

    /// The daemon processed the request and reported an error.
    Daemon(String),

    /// The daemon answered with a message that does not belong to this exchange.
    UnexpectedResponse(&'static str),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Connection(e) => write!(f, "{e}"),
            RequestError::Io(e) => write!(f, "connection to daemon failed: {e}"),
            RequestError::Daemon(message) => write!(f, "{message}"),
            RequestError::UnexpectedResponse(expected) => {
                write!(f, "unexpected response from daemon, expected {expected}")
            }
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Connection(e) => Some(e),
            RequestError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Io(e)
    }
}

impl From<ConnectionError> for RequestError {
    fn from(e: ConnectionError) -> Self {
        RequestError::Connection(e)
    }
}

struct TlsSettings {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    /// `server_name` as given on the command line, for messages.
    name: String,
}

/// A connection to the build daemon.
///
/// The underlying stream is closed when the `Client` is dropped. `close()` does the same, but
/// flushes and shuts the stream down cleanly first.
pub struct Client {
    address: String,
    endpoint: Endpoint,
    tls: Option<TlsSettings>,
    timeout: Option<Duration>,
    transport: tokio::sync::Mutex<Option<Transport>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Client {
    /// Create a client for the daemon at `address`.
    ///
    /// With `ClientOpt::WithBlock` this does not return until the connection is up and the daemon
    /// has accepted it, or until connecting failed. Nothing bounds that wait unless
    /// `ClientOpt::WithTimeout` is also given.
    pub async fn new(address: &str, opts: Vec<ClientOpt>) -> Result<Self, ConnectionError> {
        let mut block = false;
        let mut credentials = None;
        let mut timeout = None;
        for opt in opts {
            match opt {
                ClientOpt::WithBlock => block = true,
                ClientOpt::WithCredentials(creds) => credentials = Some(creds),
                ClientOpt::WithTimeout(after) => timeout = Some(after),
            }
        }

        let endpoint = address
            .parse::<Endpoint>()
            .map_err(|source| ConnectionError::InvalidAddress {
                address: address.to_string(),
                source,
            })?;

        let tls = match &credentials {
            Some(creds) => {
                let (connector, server_name) = tls::get_connector(creds)?;
                Some(TlsSettings {
                    connector,
                    server_name,
                    name: creds.server_name.clone(),
                })
            }
            None => None,
        };

        let client = Client {
            address: address.to_string(),
            endpoint,
            tls,
            timeout,
            transport: tokio::sync::Mutex::new(None),
        };

        if block {
            let transport = client.dial().await?;
            *client.transport.lock().await = Some(transport);
        }

        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a connection to the daemon is currently open.
    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    async fn dial(&self) -> Result<Transport, ConnectionError> {
        match self.timeout {
            Some(after) => tokio::time::timeout(after, self.connect())
                .await
                .map_err(|_| ConnectionError::TimedOut {
                    address: self.address.clone(),
                    after,
                })?,
            None => self.connect().await,
        }
    }

    async fn connect(&self) -> Result<Transport, ConnectionError> {
        debug!("dialing {}", self.address);

        let dial_err = |source| ConnectionError::Dial {
            address: self.address.clone(),
            source,
        };

        let stream = match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(dial_err)?;
                self.secure(stream).await?
            }
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(dial_err)?;
                stream.set_nodelay(true).map_err(dial_err)?;
                self.secure(stream).await?
            }
        };

        let mut transport = Framed::new(stream, LengthDelimitedCodec::new());

        let rejected = |reason: String| ConnectionError::Rejected {
            address: self.address.clone(),
            reason,
        };

        protocol::send(&mut transport, &Request::Ping)
            .await
            .map_err(|e| rejected(e.to_string()))?;

        match protocol::recv(&mut transport).await {
            Ok(Some(Response::Pong)) => {
                debug!("connected to {}", self.address);
                Ok(transport)
            }
            Ok(Some(Response::Error { message })) => Err(rejected(message)),
            Ok(Some(_)) => Err(rejected("unexpected reply to ping".to_string())),
            Ok(None) => Err(rejected("connection closed by daemon".to_string())),
            Err(e) => Err(rejected(e.to_string())),
        }
    }

    /// Wrap `stream` in TLS if credentials were configured.
    async fn secure<S>(&self, stream: S) -> Result<Box<dyn Io>, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let Some(tls) = &self.tls else {
            return Ok(Box::new(stream));
        };

        let stream = tls
            .connector
            .connect(tls.server_name.clone(), stream)
            .await
            .map_err(|source| ConnectionError::Handshake {
                server_name: tls.name.clone(),
                source,
            })?;

        Ok(Box::new(stream))
    }

    /// Send `request` and hand each response to `on_response` until it returns `Some`.
    async fn exchange<T, F>(&self, request: &Request, mut on_response: F) -> Result<T, RequestError>
    where
        F: FnMut(Response) -> Result<Option<T>, RequestError>,
    {
        let mut guard = self.transport.lock().await;
        let transport = match guard.take() {
            Some(transport) => transport,
            None => self.dial().await?,
        };
        let transport = guard.insert(transport);

        protocol::send(transport, request).await?;

        loop {
            let Some(response) = protocol::recv(transport).await? else {
                return Err(RequestError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by daemon",
                )));
            };

            if let Response::Error { message } = response {
                return Err(RequestError::Daemon(message));
            }

            if let Some(result) = on_response(response)? {
                return Ok(result);
            }
        }
    }

    /// Get the daemon's build cache records whose IDs start with one of `filter`, or all of them
    /// if `filter` is empty.
    pub async fn disk_usage(&self, filter: Vec<String>) -> Result<Vec<UsageRecord>, RequestError> {
        self.exchange(&Request::DiskUsage { filter }, |response| match response {
            Response::DiskUsage { records } => Ok(Some(records)),
            _ => Err(RequestError::UnexpectedResponse("disk usage records")),
        })
        .await
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>, RequestError> {
        self.exchange(&Request::ListWorkers, |response| match response {
            Response::Workers { workers } => Ok(Some(workers)),
            _ => Err(RequestError::UnexpectedResponse("worker records")),
        })
        .await
    }

    /// Run a build. `on_status` sees every progress event in the order the daemon sends them.
    /// Returns the exporter's response once the build finishes.
    pub async fn solve<F>(
        &self,
        request: SolveRequest,
        mut on_status: F,
    ) -> Result<BTreeMap<String, String>, RequestError>
    where
        F: FnMut(&StatusEvent),
    {
        self.exchange(&Request::Solve(request), |response| match response {
            Response::Status(event) => {
                on_status(&event);
                Ok(None)
            }
            Response::Solved { exporter_response } => Ok(Some(exporter_response)),
            _ => Err(RequestError::UnexpectedResponse("build status")),
        })
        .await
    }

    /// Shut the connection down.
    pub async fn close(self) {
        if let Some(mut transport) = self.transport.into_inner() {
            if let Err(e) = SinkExt::<Bytes>::close(&mut transport).await {
                debug!("error closing connection to {}: {e}", self.address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_address() {
        let err = Client::new("buildkitd:1234", vec![ClientOpt::WithBlock])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::InvalidAddress {
                source: EndpointError::MissingScheme,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn blocking_dial_failure() {
        let dir = tempfile::tempdir().unwrap();
        let address = format!("unix://{}", dir.path().join("missing.sock").display());

        let err = Client::new(&address, vec![ClientOpt::WithBlock])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Dial { .. }));
        assert!(err.to_string().starts_with(&format!("failed to dial {address}")));
    }

    #[tokio::test]
    async fn lazy_dial_defers_failure() {
        let dir = tempfile::tempdir().unwrap();
        let address = format!("unix://{}", dir.path().join("missing.sock").display());

        let client = Client::new(&address, vec![]).await.unwrap();
        assert_eq!(client.address(), address);
        assert!(!client.is_connected().await);

        let err = client.list_workers().await.unwrap_err();
        assert!(matches!(err, RequestError::Connection(ConnectionError::Dial { .. })));
    }

    #[tokio::test]
    async fn credentials_are_loaded_before_dialing() {
        let creds = TransportCredentials {
            server_name: "buildkitd".to_string(),
            ca_cert: "/nonexistent/ca.pem".to_string(),
            cert: String::new(),
            key: String::new(),
        };
        let err = Client::new(
            "tcp://127.0.0.1:1",
            vec![ClientOpt::WithBlock, ClientOpt::WithCredentials(creds)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConnectionError::Credentials(TlsError::Read { .. })));
    }
}
