// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use buildctl_lib::{
        commands,
        protocol::Request,
        test_env::{TestDaemon, TEST_FRONTEND},
    };

    /// Run buildctl in-process and return its exit status and everything it wrote to stderr.
    fn buildctl(args: &[&str], buildkit_host: Option<&str>) -> (i32, String) {
        let mut stderr = Vec::new();
        let argv = std::iter::once("buildctl").chain(args.iter().copied());
        let code = commands::run(argv, buildkit_host.map(String::from), &mut stderr);
        (code, String::from_utf8(stderr).unwrap())
    }

    fn unix_daemon(dir: &tempfile::TempDir, name: &str) -> TestDaemon {
        TestDaemon::unix(&dir.path().join(name)).unwrap()
    }

    #[test]
    fn du_success() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = unix_daemon(&dir, "buildkitd.sock");

        let (code, stderr) = buildctl(&["--addr", daemon.address(), "du"], None);

        assert_eq!(code, 0);
        assert_eq!(stderr, "");
        assert_eq!(daemon.connections(), 1);
        assert_eq!(
            daemon.requests(),
            vec![Request::Ping, Request::DiskUsage { filter: vec![] }]
        );
    }

    #[test]
    fn du_filters_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = unix_daemon(&dir, "buildkitd.sock");

        let (code, _) = buildctl(
            &["--addr", daemon.address(), "du", "-f", "a1", "--filter", "f6", "-v"],
            None,
        );

        assert_eq!(code, 0);
        assert_eq!(
            daemon.requests()[1],
            Request::DiskUsage {
                filter: vec!["a1".to_string(), "f6".to_string()]
            }
        );
    }

    #[test]
    fn buildkit_host_is_the_default_address() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = unix_daemon(&dir, "buildkitd.sock");

        let (code, stderr) = buildctl(&["du"], Some(daemon.address()));

        assert_eq!(code, 0, "{stderr}");
        assert_eq!(daemon.connections(), 1);
    }

    #[test]
    fn addr_flag_beats_buildkit_host() {
        let dir = tempfile::tempdir().unwrap();
        let flagged = unix_daemon(&dir, "flag.sock");
        let from_env = unix_daemon(&dir, "env.sock");

        let (code, stderr) = buildctl(
            &["--addr", flagged.address(), "du"],
            Some(from_env.address()),
        );

        assert_eq!(code, 0, "{stderr}");
        assert_eq!(flagged.connections(), 1);
        assert_eq!(from_env.connections(), 0);
    }

    #[test]
    fn unknown_command_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = unix_daemon(&dir, "buildkitd.sock");

        let (code, stderr) = buildctl(&["--addr", daemon.address(), "frobnicate"], None);

        assert_eq!(code, 1);
        assert_eq!(stderr, "error: unknown command \"frobnicate\"\n");
        assert_eq!(daemon.connections(), 0);
    }

    #[test]
    fn unknown_command_debug() {
        let (code, stderr) = buildctl(&["--debug", "frobnicate"], None);

        assert_eq!(code, 1);
        assert_eq!(stderr, "error: UnknownCommand(\"frobnicate\")\n");
    }

    #[test]
    fn subcommand_flag_error_debug() {
        let (code, stderr) = buildctl(&["--debug", "du", "--bogus"], None);
        assert_eq!(code, 1);
        assert!(stderr.starts_with("error: Usage("), "{stderr}");

        // --debug is global, so it counts after the subcommand too.
        let (code, stderr) = buildctl(&["du", "--bogus", "--debug"], None);
        assert_eq!(code, 1);
        assert!(stderr.starts_with("error: Usage("), "{stderr}");

        let (code, stderr) = buildctl(&["du", "--bogus"], None);
        assert_eq!(code, 1);
        assert!(stderr.starts_with("error: unexpected argument"), "{stderr}");
    }

    #[test]
    fn daemon_rejects_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let daemon =
            TestDaemon::unix_rejecting(&dir.path().join("buildkitd.sock"), "too many clients")
                .unwrap();

        let (code, stderr) = buildctl(&["--addr", daemon.address(), "du"], None);

        assert_eq!(code, 1);
        assert_eq!(
            stderr,
            format!(
                "error: daemon at {} rejected the connection: too many clients\n",
                daemon.address()
            )
        );
        assert_eq!(daemon.requests(), vec![Request::Ping]);
    }

    #[test]
    fn zero_timeout_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = unix_daemon(&dir, "buildkitd.sock");

        let (code, stderr) = buildctl(&["--timeout", "0", "--addr", daemon.address(), "du"], None);

        assert_eq!(code, 1);
        assert!(stderr.starts_with("error: invalid value '0'"), "{stderr}");
        assert_eq!(daemon.connections(), 0);
    }

    #[test]
    fn bad_flag_is_reported() {
        let (code, stderr) = buildctl(&["--bogus", "du"], None);

        assert_eq!(code, 1);
        assert!(stderr.starts_with("error: "), "{stderr}");
        assert!(stderr.contains("--bogus"), "{stderr}");
    }

    #[test]
    fn connection_failure_terse() {
        let dir = tempfile::tempdir().unwrap();
        let addr = format!("unix://{}", dir.path().join("missing.sock").display());

        let (code, stderr) = buildctl(&["--addr", &addr, "du"], None);

        assert_eq!(code, 1);
        assert!(
            stderr.starts_with(&format!("error: failed to dial {addr}: ")),
            "{stderr}"
        );
        assert_eq!(stderr.lines().count(), 1);
    }

    #[test]
    fn connection_failure_debug() {
        let dir = tempfile::tempdir().unwrap();
        let addr = format!("unix://{}", dir.path().join("missing.sock").display());

        let (code, stderr) = buildctl(&["--debug", "--addr", &addr, "du"], None);

        assert_eq!(code, 1);
        assert!(stderr.starts_with("error: Connection(Dial {"), "{stderr}");
        assert!(stderr.contains(&format!("address: \"{addr}\"")), "{stderr}");
    }

    #[test]
    fn malformed_address() {
        let (code, stderr) = buildctl(&["--addr", "buildkitd:1234", "du"], None);

        assert_eq!(code, 1);
        assert_eq!(
            stderr,
            "error: invalid daemon address \"buildkitd:1234\": address has no scheme\n"
        );
    }

    #[test]
    fn tls_paths_without_server_name_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = unix_daemon(&dir, "buildkitd.sock");

        let (code, stderr) = buildctl(
            &[
                "--addr",
                daemon.address(),
                "--ca-cert",
                "/nonexistent/ca.pem",
                "--cert",
                "/nonexistent/cert.pem",
                "--key",
                "/nonexistent/key.pem",
                "du",
            ],
            None,
        );

        assert_eq!(code, 0, "{stderr}");
        assert_eq!(daemon.connections(), 1);
    }

    #[test]
    fn server_name_requires_a_ca() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = unix_daemon(&dir, "buildkitd.sock");

        let (code, stderr) = buildctl(
            &["--addr", daemon.address(), "--server-name", "buildkitd", "du"],
            None,
        );

        assert_eq!(code, 1);
        assert!(stderr.starts_with("error: failed to load credentials: "), "{stderr}");
        assert_eq!(daemon.connections(), 0);
    }

    #[test]
    fn connect_timeout() {
        // Connections to this listener are queued by the kernel but never answered.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("tcp://{}", listener.local_addr().unwrap());

        let (code, stderr) = buildctl(&["--timeout", "1", "--addr", &addr, "du"], None);

        assert_eq!(code, 1);
        assert_eq!(stderr, format!("error: timed out after 1s connecting to {addr}\n"));
    }

    #[test]
    fn build_with_frontend() {
        let daemon = TestDaemon::tcp().unwrap();

        let (code, stderr) = buildctl(
            &[
                "--addr",
                daemon.address(),
                "build",
                "--frontend",
                TEST_FRONTEND,
                "--frontend-opt",
                "filename=Dockerfile",
                "--exporter",
                "image",
                "--exporter-opt",
                "name=docker.io/library/test:latest",
                "--progress",
                "none",
            ],
            None,
        );

        assert_eq!(code, 0, "{stderr}");
        assert_eq!(stderr, "");

        let requests = daemon.requests();
        let Request::Solve(solve) = &requests[1] else {
            panic!("expected a solve request, got {requests:?}");
        };
        assert_eq!(solve.frontend.as_deref(), Some(TEST_FRONTEND));
        assert_eq!(solve.frontend_attrs["filename"], "Dockerfile");
        assert_eq!(solve.exporter.as_deref(), Some("image"));
        assert_eq!(
            solve.exporter_attrs["name"],
            "docker.io/library/test:latest"
        );
        assert!(solve.definition.is_none());
    }

    #[test]
    fn build_progress_goes_to_stderr_not_the_report() {
        let daemon = TestDaemon::tcp().unwrap();

        let (code, stderr) = buildctl(
            &["--addr", daemon.address(), "build", "--frontend", TEST_FRONTEND],
            None,
        );

        // Progress is written with eprintln!, not to the error stream handed to run().
        assert_eq!(code, 0);
        assert_eq!(stderr, "");
    }

    #[test]
    fn build_failure_is_reported() {
        let daemon = TestDaemon::tcp().unwrap();

        let (code, stderr) = buildctl(
            &["--addr", daemon.address(), "build", "--frontend", "nope.v0"],
            None,
        );

        assert_eq!(code, 1);
        assert_eq!(stderr, "error: frontend \"nope.v0\" not found\n");
    }

    #[test]
    fn bad_build_options_fail_before_connecting() {
        let daemon = TestDaemon::tcp().unwrap();

        let (code, stderr) = buildctl(
            &[
                "--addr",
                daemon.address(),
                "build",
                "--frontend",
                TEST_FRONTEND,
                "--exporter-opt",
                "novalue",
            ],
            None,
        );

        assert_eq!(code, 1);
        assert_eq!(
            stderr,
            "error: invalid exporter option \"novalue\": expected key=value\n"
        );
        assert_eq!(daemon.connections(), 0);
    }

    #[test]
    fn debug_workers() {
        let daemon = TestDaemon::tcp().unwrap();

        let (code, stderr) = buildctl(&["--addr", daemon.address(), "debug", "workers"], None);

        assert_eq!(code, 0, "{stderr}");
        assert_eq!(daemon.requests(), vec![Request::Ping, Request::ListWorkers]);
    }
}
