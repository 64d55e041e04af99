// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeMap,
    io,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use {
    log::debug,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::oneshot,
    },
    tokio_rustls::TlsAcceptor,
    tokio_util::codec::{Framed, LengthDelimitedCodec},
};

use crate::protocol::{
    self, Request, Response, SolveRequest, StatusEvent, UsageRecord, WorkerRecord,
};

/// The only frontend the test daemon knows how to run.
pub const TEST_FRONTEND: &str = "dockerfile.v0";

/// Canned state served by a `TestDaemon`, plus a record of what clients asked for.
#[derive(Debug)]
struct DaemonState {
    records: Vec<UsageRecord>,
    workers: Vec<WorkerRecord>,
    /// When set, every client is turned away with this reason in reply to its `Ping`.
    reject: Option<String>,
    connections: AtomicUsize,
    requests: Mutex<Vec<Request>>,
}

impl DaemonState {
    fn respond(&self, request: &Request) -> Vec<Response> {
        match request {
            Request::Ping => match &self.reject {
                Some(reason) => vec![Response::Error {
                    message: reason.clone(),
                }],
                None => vec![Response::Pong],
            },
            Request::DiskUsage { filter } => {
                let records = self
                    .records
                    .iter()
                    .filter(|r| filter.is_empty() || filter.iter().any(|f| r.id.starts_with(f)))
                    .cloned()
                    .collect();
                vec![Response::DiskUsage { records }]
            }
            Request::ListWorkers => vec![Response::Workers {
                workers: self.workers.clone(),
            }],
            Request::Solve(solve) => solve_responses(solve),
        }
    }
}

fn solve_responses(solve: &SolveRequest) -> Vec<Response> {
    let mut responses = Vec::new();

    match (&solve.definition, &solve.frontend) {
        (_, Some(frontend)) if frontend != TEST_FRONTEND => {
            return vec![Response::Error {
                message: format!("frontend \"{frontend}\" not found"),
            }];
        }
        (_, Some(frontend)) => responses.push(Response::Status(StatusEvent {
            vertex: "frontend".to_string(),
            name: format!("[frontend] {frontend}"),
            cached: false,
            completed: true,
            error: None,
        })),
        (Some(definition), None) => {
            for op in definition.ops.iter() {
                responses.push(Response::Status(StatusEvent {
                    vertex: op.digest.clone(),
                    name: op.kind.clone(),
                    cached: !solve.no_cache,
                    completed: true,
                    error: None,
                }));
            }
        }
        (None, None) => {
            return vec![Response::Error {
                message: "no definition or frontend given".to_string(),
            }];
        }
    }

    let mut exporter_response = solve.exporter_attrs.clone();
    if let Some(exporter) = &solve.exporter {
        exporter_response.insert("exporter".to_string(), exporter.clone());
    }
    responses.push(Response::Solved { exporter_response });
    responses
}

/// Cache records served by every `TestDaemon`.
pub fn sample_records() -> Vec<UsageRecord> {
    vec![
        UsageRecord {
            id: "a1b2c3d4e5".to_string(),
            mutable: false,
            in_use: false,
            shared: false,
            size: 4_200_000,
            parent: None,
            created_at: 1_500_000_000,
            last_used_at: Some(1_500_003_600),
            usage_count: 3,
            description: "pulled from docker.io/library/alpine:latest".to_string(),
        },
        UsageRecord {
            id: "f6e5d4c3b2".to_string(),
            mutable: true,
            in_use: true,
            shared: true,
            size: 1_000,
            parent: Some("a1b2c3d4e5".to_string()),
            created_at: 1_500_000_100,
            last_used_at: None,
            usage_count: 1,
            description: "mount / from exec /bin/sh -c true".to_string(),
        },
    ]
}

/// Workers served by every `TestDaemon`.
pub fn sample_workers() -> Vec<WorkerRecord> {
    vec![WorkerRecord {
        id: "worker0".to_string(),
        platforms: vec!["linux/amd64".to_string(), "linux/386".to_string()],
        labels: BTreeMap::from([("executor".to_string(), "oci".to_string())]),
    }]
}

enum Listener {
    Unix(std::os::unix::net::UnixListener),
    Tcp(std::net::TcpListener),
}

/// A build daemon stand-in that runs on its own thread for the duration of a test. It answers
/// every request from the canned state in `sample_records()` and `sample_workers()`.
///
/// The daemon shuts down when the `TestDaemon` is dropped.
pub struct TestDaemon {
    address: String,
    state: Arc<DaemonState>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestDaemon {
    /// Listen on a unix socket at `path`.
    pub fn unix(path: &Path) -> io::Result<Self> {
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        let address = format!("unix://{}", path.display());
        Self::start(address, Listener::Unix(listener), None, None)
    }

    /// Listen on a unix socket at `path`, refusing every client with `reason`.
    pub fn unix_rejecting(path: &Path, reason: &str) -> io::Result<Self> {
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        let address = format!("unix://{}", path.display());
        Self::start(
            address,
            Listener::Unix(listener),
            None,
            Some(reason.to_string()),
        )
    }

    /// Listen on an unused port on the loopback interface.
    pub fn tcp() -> io::Result<Self> {
        Self::tcp_with_tls(None)
    }

    /// Listen on an unused loopback port, requiring TLS as described by `config`.
    pub fn tcp_tls(config: Arc<rustls::ServerConfig>) -> io::Result<Self> {
        Self::tcp_with_tls(Some(TlsAcceptor::from(config)))
    }

    fn tcp_with_tls(acceptor: Option<TlsAcceptor>) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let address = format!("tcp://{}", listener.local_addr()?);
        Self::start(address, Listener::Tcp(listener), acceptor, None)
    }

    fn start(
        address: String,
        listener: Listener,
        acceptor: Option<TlsAcceptor>,
        reject: Option<String>,
    ) -> io::Result<Self> {
        match &listener {
            Listener::Unix(l) => l.set_nonblocking(true)?,
            Listener::Tcp(l) => l.set_nonblocking(true)?,
        };

        let state = Arc::new(DaemonState {
            records: sample_records(),
            workers: sample_workers(),
            reject,
            connections: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let thread = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                rt.block_on(accept_loop(listener, acceptor, state, shutdown_rx));
            })
        };

        Ok(Self {
            address,
            state,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    /// The address clients should use, e.g. to pass to `--addr`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// How many connections have been accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Every request received so far, in order. Pings are included.
    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn accept_loop(
    listener: Listener,
    acceptor: Option<TlsAcceptor>,
    state: Arc<DaemonState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let listener = match listener {
        Listener::Unix(l) => tokio::net::UnixListener::from_std(l).map(AsyncListener::Unix),
        Listener::Tcp(l) => tokio::net::TcpListener::from_std(l).map(AsyncListener::Tcp),
    };
    let listener = match listener {
        Ok(l) => l,
        Err(e) => {
            eprintln!("test daemon could not register its listener: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        eprintln!("test daemon accept failed: {e}");
                        continue;
                    }
                };
                state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle(stream, acceptor.clone(), Arc::clone(&state)));
            }
        }
    }
}

enum AsyncListener {
    Unix(tokio::net::UnixListener),
    Tcp(tokio::net::TcpListener),
}

impl AsyncListener {
    async fn accept(&self) -> io::Result<AcceptedStream> {
        match self {
            AsyncListener::Unix(l) => Ok(AcceptedStream::Unix(l.accept().await?.0)),
            AsyncListener::Tcp(l) => Ok(AcceptedStream::Tcp(l.accept().await?.0)),
        }
    }
}

enum AcceptedStream {
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

async fn handle(stream: AcceptedStream, acceptor: Option<TlsAcceptor>, state: Arc<DaemonState>) {
    let result = match (stream, acceptor) {
        (AcceptedStream::Unix(s), None) => serve(s, &state).await,
        (AcceptedStream::Tcp(s), None) => serve(s, &state).await,
        (AcceptedStream::Unix(s), Some(acceptor)) => match acceptor.accept(s).await {
            Ok(s) => serve(s, &state).await,
            Err(e) => Err(e),
        },
        (AcceptedStream::Tcp(s), Some(acceptor)) => match acceptor.accept(s).await {
            Ok(s) => serve(s, &state).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        debug!("test daemon connection ended: {e}");
    }
}

async fn serve<S: AsyncRead + AsyncWrite + Unpin>(stream: S, state: &DaemonState) -> io::Result<()> {
    let mut transport = Framed::new(stream, LengthDelimitedCodec::new());

    while let Some(request) = protocol::recv::<_, Request>(&mut transport).await? {
        state.requests.lock().unwrap().push(request.clone());
        for response in state.respond(&request) {
            protocol::send(&mut transport, &response).await?;
        }
    }

    Ok(())
}
