// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use buildctl_lib::{self, commands};

/// The buildctl binary drives a build daemon: "du", "build", "debug", etc.
fn main() {
    // Read once, before the command line is parsed; it only serves as the default for --addr.
    let buildkit_host = buildctl_lib::buildkit_host();

    let code = commands::run(std::env::args_os(), buildkit_host, &mut std::io::stderr());

    std::process::exit(code);
}
