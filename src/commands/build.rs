// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::collections::BTreeMap;

use {
    clap::{Args, ValueEnum},
    log::debug,
    tokio::io::AsyncReadExt,
};

use crate::{
    commands::{self, resolve_client, Error},
    config::GlobalConfig,
    protocol::{Definition, SolveRequest, StatusEvent},
};

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Frontend that produces the build definition. Without it, the definition is read from stdin
    #[arg(long)]
    frontend: Option<String>,

    /// Frontend option, as key=value
    #[arg(long = "frontend-opt", value_name = "KEY=VALUE")]
    frontend_opt: Vec<String>,

    /// Exporter for the build result
    #[arg(long)]
    exporter: Option<String>,

    /// Exporter option, as key=value
    #[arg(long = "exporter-opt", value_name = "KEY=VALUE")]
    exporter_opt: Vec<String>,

    /// Local directory to expose to the build, as name=path
    #[arg(long, value_name = "NAME=PATH")]
    local: Vec<String>,

    /// Ignore the build cache
    #[arg(long)]
    no_cache: bool,

    /// How to show build progress on stderr
    #[arg(long, value_enum, default_value_t = Progress::Auto)]
    progress: Progress,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Auto,
    Plain,
    None,
}

pub async fn build(config: &GlobalConfig, args: &BuildArgs) -> commands::Result {
    let mut request = SolveRequest {
        definition: None,
        frontend: args.frontend.clone(),
        frontend_attrs: parse_attrs("frontend option", &args.frontend_opt)?,
        exporter: args.exporter.clone(),
        exporter_attrs: parse_attrs("exporter option", &args.exporter_opt)?,
        local_dirs: resolve_local_dirs(&args.local)?,
        no_cache: args.no_cache,
    };

    if request.frontend.is_none() {
        request.definition = Some(read_definition().await?);
    }

    let client = resolve_client(config).await?;
    let show_progress = args.progress != Progress::None;
    let result = client
        .solve(request, |status| {
            if show_progress {
                eprintln!("{}", status_line(status));
            }
        })
        .await;
    client.close().await;

    for (key, value) in result? {
        println!("{key}: {value}");
    }

    Ok(())
}

/// Read a JSON build definition from stdin.
pub(crate) async fn read_definition() -> commands::Result<Definition> {
    let mut data = Vec::new();
    tokio::io::stdin().read_to_end(&mut data).await?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::command(
            "no build definition on stdin (pipe one in, or use --frontend)",
        ));
    }

    let definition = Definition::from_slice(&data)
        .map_err(|e| Error::command(format!("invalid build definition: {e}")))?;
    debug!("read build definition with {} ops", definition.ops.len());
    Ok(definition)
}

/// Split each `key=value` into a map entry. Later duplicates win.
fn parse_attrs(what: &str, values: &[String]) -> commands::Result<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    for value in values {
        match value.split_once('=') {
            Some((key, val)) if !key.is_empty() => {
                attrs.insert(key.to_string(), val.to_string());
            }
            _ => {
                return Err(Error::command(format!(
                    "invalid {what} \"{value}\": expected key=value"
                )))
            }
        }
    }
    Ok(attrs)
}

/// Parse `--local name=path` values, turning each path into an absolute one. The paths must exist.
fn resolve_local_dirs(values: &[String]) -> commands::Result<BTreeMap<String, String>> {
    let mut dirs = BTreeMap::new();
    for (name, path) in parse_attrs("local directory", values)? {
        let abs = std::fs::canonicalize(&path)
            .map_err(|e| Error::command(format!("invalid local directory \"{name}\": {path}: {e}")))?;
        dirs.insert(name, abs.to_string_lossy().into_owned());
    }
    Ok(dirs)
}

fn status_line(status: &StatusEvent) -> String {
    let state = match (&status.error, status.cached, status.completed) {
        (Some(e), _, _) => format!("ERROR: {e}"),
        (None, true, _) => "CACHED".to_string(),
        (None, false, true) => "DONE".to_string(),
        (None, false, false) => "RUNNING".to_string(),
    };
    let vertex = status.vertex.strip_prefix("sha256:").unwrap_or(&status.vertex);
    let short: String = vertex.chars().take(12).collect();
    format!("#{short} {} {state}", status.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attrs() {
        let attrs = parse_attrs(
            "frontend option",
            &["filename=Dockerfile".to_string(), "build-arg:A=b=c".to_string()],
        )
        .unwrap();
        assert_eq!(attrs["filename"], "Dockerfile");
        assert_eq!(attrs["build-arg:A"], "b=c");
    }

    #[test]
    fn attrs_need_a_key() {
        for bad in ["novalue", "=value"] {
            let err = parse_attrs("exporter option", &[bad.to_string()]).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("invalid exporter option \"{bad}\": expected key=value")
            );
        }
    }

    #[test]
    fn local_dirs_are_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = resolve_local_dirs(&[format!("context={}", dir.path().display())]).unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(dirs["context"], expected.to_string_lossy());

        let missing = dir.path().join("missing");
        let err = resolve_local_dirs(&[format!("context={}", missing.display())]).unwrap_err();
        assert!(matches!(err, Error::Command(_)));
    }

    #[test]
    fn status_lines() {
        let mut status = StatusEvent {
            vertex: "sha256:0123456789abcdef".to_string(),
            name: "exec".to_string(),
            cached: false,
            completed: true,
            error: None,
        };
        assert_eq!(status_line(&status), "#0123456789ab exec DONE");

        status.cached = true;
        assert_eq!(status_line(&status), "#0123456789ab exec CACHED");

        status.error = Some("exit code 1".to_string());
        status.vertex = "frontend".to_string();
        assert_eq!(status_line(&status), "#frontend exec ERROR: exit code 1");
    }

    #[test]
    fn progress_modes() {
        let parse = |args: &[&str]| {
            let argv = ["buildctl", "build", "--frontend", "dockerfile.v0"]
                .into_iter()
                .chain(args.iter().copied());
            match commands::Cli::try_parse_with_host(argv, None).unwrap().command {
                Some(commands::Commands::Build(args)) => args.progress,
                other => panic!("expected build, got {other:?}"),
            }
        };

        assert_eq!(parse(&[]), Progress::Auto);
        assert_eq!(parse(&["--progress", "plain"]), Progress::Plain);
        assert_eq!(parse(&["--progress=none"]), Progress::None);
        assert!(commands::Cli::try_parse_with_host(
            ["buildctl", "build", "--progress", "fancy"],
            None
        )
        .is_err());
    }
}
