// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    io::{self, Write},
    time::{SystemTime, UNIX_EPOCH},
};

use clap::Args;

use crate::{
    commands::{self, resolve_client},
    config::GlobalConfig,
    protocol::UsageRecord,
};

#[derive(Args, Debug, Clone)]
pub struct DuArgs {
    /// Only show records whose ID starts with this prefix
    #[arg(short, long)]
    filter: Vec<String>,

    /// Show every field of each record
    #[arg(short, long)]
    verbose: bool,
}

pub async fn du(config: &GlobalConfig, args: &DuArgs) -> commands::Result {
    let client = resolve_client(config).await?;
    let records = client.disk_usage(args.filter.clone()).await;
    client.close().await;
    let records = records?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut out = io::stdout().lock();
    if args.verbose {
        print_verbose(&mut out, &records, now)?;
    } else {
        print_table(&mut out, &records, now)?;
    }
    print_summary(&mut out, &records)?;

    Ok(())
}

fn print_table(out: &mut impl Write, records: &[UsageRecord], now: u64) -> io::Result<()> {
    let rows: Vec<[String; 4]> = records
        .iter()
        .map(|r| {
            [
                if r.mutable {
                    format!("{}*", r.id)
                } else {
                    r.id.clone()
                },
                (!r.in_use).to_string(),
                human_size(r.size),
                match r.last_used_at {
                    Some(t) => format!("{} ago", human_duration(now.saturating_sub(t))),
                    None => String::new(),
                },
            ]
        })
        .collect();

    let header = ["ID", "RECLAIMABLE", "SIZE", "LAST ACCESSED"].map(String::from);
    let mut widths = header.clone().map(|h| h.len());
    for row in rows.iter() {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    for row in std::iter::once(&header).chain(rows.iter()) {
        let line = format!(
            "{:<w0$}  {:<w1$}  {:<w2$}  {}",
            row[0],
            row[1],
            row[2],
            row[3],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
        );
        writeln!(out, "{}", line.trim_end())?;
    }

    Ok(())
}

fn print_verbose(out: &mut impl Write, records: &[UsageRecord], now: u64) -> io::Result<()> {
    for r in records {
        writeln!(out, "ID:\t\t{}", r.id)?;
        if let Some(parent) = &r.parent {
            writeln!(out, "Parent:\t\t{parent}")?;
        }
        writeln!(
            out,
            "Created at:\t{} ago",
            human_duration(now.saturating_sub(r.created_at))
        )?;
        writeln!(out, "Mutable:\t{}", r.mutable)?;
        writeln!(out, "Reclaimable:\t{}", !r.in_use)?;
        writeln!(out, "Shared:\t\t{}", r.shared)?;
        writeln!(out, "Size:\t\t{}", human_size(r.size))?;
        if !r.description.is_empty() {
            writeln!(out, "Description:\t{}", r.description)?;
        }
        writeln!(out, "Usage count:\t{}", r.usage_count)?;
        if let Some(t) = r.last_used_at {
            writeln!(out, "Last used:\t{} ago", human_duration(now.saturating_sub(t)))?;
        }
        writeln!(out)?;
    }

    Ok(())
}

fn print_summary(out: &mut impl Write, records: &[UsageRecord]) -> io::Result<()> {
    let total: u64 = records.iter().map(|r| r.size).sum();
    let reclaimable: u64 = records.iter().filter(|r| !r.in_use).map(|r| r.size).sum();
    let shared: u64 = records.iter().filter(|r| r.shared).map(|r| r.size).sum();

    if shared > 0 {
        writeln!(out, "Shared:\t\t{}", human_size(shared))?;
        writeln!(out, "Private:\t{}", human_size(total - shared))?;
    }
    writeln!(out, "Reclaimable:\t{}", human_size(reclaimable))?;
    writeln!(out, "Total:\t\t{}", human_size(total))?;

    Ok(())
}

/// Format a byte count with decimal units and four significant digits, e.g. `4.2MB`.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }

    let decimals = match size {
        s if s >= 100.0 => 1,
        s if s >= 10.0 => 2,
        _ => 3,
    };
    let formatted = format!("{size:.decimals$}");
    let formatted = if formatted.contains('.') {
        formatted.trim_end_matches('0').trim_end_matches('.')
    } else {
        &formatted
    };

    format!("{formatted}{}", UNITS[unit])
}

/// Describe an elapsed number of seconds the way people say it, e.g. `About an hour`.
fn human_duration(secs: u64) -> String {
    let minutes = secs / 60;
    let hours = minutes / 60;

    match secs {
        0 => "Less than a second".to_string(),
        1 => "1 second".to_string(),
        s if s < 60 => format!("{s} seconds"),
        _ if minutes == 1 => "About a minute".to_string(),
        _ if minutes < 60 => format!("{minutes} minutes"),
        _ if hours == 1 => "About an hour".to_string(),
        _ if hours < 48 => format!("{hours} hours"),
        _ if hours < 24 * 7 * 2 => format!("{} days", hours / 24),
        _ if hours < 24 * 30 * 2 => format!("{} weeks", hours / 24 / 7),
        _ if hours < 24 * 365 * 2 => format!("{} months", hours / 24 / 30),
        _ => format!("{} years", hours / 24 / 365),
    }
}
