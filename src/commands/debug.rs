// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::io::{self, Write};

use clap::{Args, Subcommand};

use crate::{
    commands::{self, build::read_definition, resolve_client},
    config::GlobalConfig,
    protocol::{Definition, WorkerRecord},
};

#[derive(Args, Debug, Clone)]
pub struct DebugArgs {
    #[command(subcommand)]
    command: DebugCommands,
}

#[derive(Subcommand, Debug, Clone)]
enum DebugCommands {
    /// List the daemon's workers
    Workers(WorkersArgs),
    /// Print the operations of a build definition read from stdin
    DumpLlb(DumpLlbArgs),
}

#[derive(Args, Debug, Clone)]
struct WorkersArgs {
    /// Show labels as well as platforms
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug, Clone)]
struct DumpLlbArgs {
    /// Print each operation as a JSON document
    #[arg(long)]
    json: bool,
}

pub async fn debug(config: &GlobalConfig, args: &DebugArgs) -> commands::Result {
    match &args.command {
        DebugCommands::Workers(args) => workers(config, args).await,
        DebugCommands::DumpLlb(args) => dump_llb(args).await,
    }
}

async fn workers(config: &GlobalConfig, args: &WorkersArgs) -> commands::Result {
    let client = resolve_client(config).await?;
    let workers = client.list_workers().await;
    client.close().await;

    let mut out = io::stdout().lock();
    print_workers(&mut out, &workers?, args.verbose)?;
    Ok(())
}

/// Decoding the definition happens entirely on this side; the daemon is never contacted.
async fn dump_llb(args: &DumpLlbArgs) -> commands::Result {
    let definition = read_definition().await?;
    let mut out = io::stdout().lock();
    print_definition(&mut out, &definition, args.json)?;
    Ok(())
}

fn print_workers(out: &mut impl Write, workers: &[WorkerRecord], verbose: bool) -> io::Result<()> {
    if verbose {
        for worker in workers {
            writeln!(out, "ID:\t\t{}", worker.id)?;
            writeln!(out, "Platforms:\t{}", worker.platforms.join(","))?;
            writeln!(out, "Labels:")?;
            for (key, value) in worker.labels.iter() {
                writeln!(out, "\t{key}:\t{value}")?;
            }
            writeln!(out)?;
        }
        return Ok(());
    }

    let width = workers
        .iter()
        .map(|w| w.id.len())
        .chain(std::iter::once("ID".len()))
        .max()
        .unwrap_or_default();
    writeln!(out, "{:<width$}  PLATFORMS", "ID")?;
    for worker in workers {
        writeln!(out, "{:<width$}  {}", worker.id, worker.platforms.join(","))?;
    }
    Ok(())
}

fn print_definition(out: &mut impl Write, definition: &Definition, json: bool) -> io::Result<()> {
    for op in definition.ops.iter() {
        if json {
            serde_json::to_writer(&mut *out, op)?;
            writeln!(out)?;
            continue;
        }

        write!(out, "{} {}", op.digest, op.kind)?;
        if !op.inputs.is_empty() {
            write!(out, " inputs=[{}]", op.inputs.join(", "))?;
        }
        for (key, value) in op.attrs.iter() {
            write!(out, " {key}={value}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}
