// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! protocol.rs
//!
//! Messages exchanged with the build daemon. Each message is a JSON document carried in one
//! length-delimited frame. A connection carries any number of request/response exchanges; most
//! requests get exactly one response, while `Solve` gets a stream of `Status` responses that ends
//! with `Solved` or `Error`.

use std::{collections::BTreeMap, io};

use {
    bytes::Bytes,
    futures::{SinkExt, StreamExt},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_util::codec::{Framed, LengthDelimitedCodec},
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Sent once right after connecting; the daemon answers `Pong` if it accepts the client.
    Ping,
    DiskUsage { filter: Vec<String> },
    Solve(SolveRequest),
    ListWorkers,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    DiskUsage { records: Vec<UsageRecord> },
    Status(StatusEvent),
    Solved { exporter_response: BTreeMap<String, String> },
    Workers { workers: Vec<WorkerRecord> },
    Error { message: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SolveRequest {
    /// A build definition; unset when a frontend produces the definition on the daemon side.
    pub definition: Option<Definition>,
    pub frontend: Option<String>,
    pub frontend_attrs: BTreeMap<String, String>,
    pub exporter: Option<String>,
    pub exporter_attrs: BTreeMap<String, String>,
    /// Local directories made available to the build, keyed by name.
    pub local_dirs: BTreeMap<String, String>,
    pub no_cache: bool,
}

/// A build graph: a list of operations, each referring to its inputs by digest.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Definition {
    pub ops: Vec<Op>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Op {
    pub digest: String,
    pub kind: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl Definition {
    /// Decode a definition from the JSON document a caller piped in.
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// One entry in the daemon's build cache.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub id: String,
    pub mutable: bool,
    pub in_use: bool,
    pub shared: bool,
    pub size: u64,
    pub parent: Option<String>,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub last_used_at: Option<u64>,
    pub usage_count: u64,
    pub description: String,
}

/// Progress of a single vertex of a running build.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub vertex: String,
    pub name: String,
    pub cached: bool,
    pub completed: bool,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerRecord {
    pub id: String,
    pub platforms: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Encode `message` and write it as one frame.
pub async fn send<S, T>(transport: &mut Framed<S, LengthDelimitedCodec>, message: &T) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message)?;
    transport.send(Bytes::from(data)).await
}

/// Read the next frame and decode it. `Ok(None)` means the peer closed the connection.
pub async fn recv<S, T>(transport: &mut Framed<S, LengthDelimitedCodec>) -> io::Result<Option<T>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    match transport.next().await {
        Some(frame) => Ok(Some(serde_json::from_slice(&frame?)?)),
        None => Ok(None),
    }
}
