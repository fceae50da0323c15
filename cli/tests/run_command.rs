mod common;

use common::{console_pipe, read_all, run_with_timeout};
use procfan_cli::{check_config, resolve_config, run_process, CliError, Console, Overrides};
use std::io::Write;
use std::time::Duration;
use tokio::io::DuplexStream;

fn overrides(command: &[&str]) -> Overrides {
    Overrides {
        command: command.iter().map(|s| s.to_string()).collect(),
        ..Overrides::default()
    }
}

#[test]
fn test_resolve_defaults_and_flags() {
    let config = resolve_config(None, &overrides(&["echo", "hi"])).unwrap();
    assert_eq!(config.command, "echo");
    assert_eq!(config.args, vec!["hi"]);
    assert!(config.stdout && config.stderr && !config.stdin);

    let mut flags = overrides(&["cat"]);
    flags.stdin = true;
    flags.no_stderr = true;
    flags.max_wait_ms = Some(250);
    let config = resolve_config(None, &flags).unwrap();
    assert!(config.stdin && config.stdout && !config.stderr);
    assert_eq!(config.max_wait_time(), Some(Duration::from_millis(250)));
}

#[test]
fn test_resolve_requires_command() {
    let err = resolve_config(None, &Overrides::default()).unwrap_err();
    assert!(matches!(err, CliError::InvalidArgument(_)));
}

#[test]
fn test_resolve_from_file_and_check() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "command = \"sleep\"\nargs = [\"1\"]\nstdout = true\nmaxWaitMs = 500").unwrap();

    let config = resolve_config(Some(file.path()), &Overrides::default()).unwrap();
    assert_eq!(config.command, "sleep");
    assert!(config.stdout && !config.stderr);

    let config = resolve_config(Some(file.path()), &overrides(&["true"])).unwrap();
    assert_eq!(config.command, "true");
    assert!(config.args.is_empty());

    let summary = check_config(file.path()).unwrap();
    assert!(summary.contains("command 'sleep' with 1 args, streams [stdout], max wait 500ms"));

    let err = check_config(std::path::Path::new("/nonexistent/procfan.toml")).unwrap_err();
    assert_eq!(err.code(), "CLI003");
}

#[tokio::test]
async fn test_run_prints_streams_and_returns_exit_code() {
    let config = resolve_config(None, &overrides(&["/bin/sh", "-c", "echo out; echo err >&2; exit 3"]))
        .unwrap();
    let (stdout, stdout_reader) = console_pipe();
    let (stderr, stderr_reader) = console_pipe();
    let console = Console {
        stdout,
        stderr,
        prefix: true,
    };

    let code = run_with_timeout(
        Duration::from_secs(10),
        run_process(config, console, None::<DuplexStream>, std::future::pending()),
    )
    .await
    .unwrap();

    assert_eq!(code, 3);
    assert_eq!(read_all(stdout_reader).await, "[stdout] out\n");
    assert_eq!(read_all(stderr_reader).await, "[stderr] err\n");
}

#[tokio::test]
async fn test_run_prints_every_line_of_a_burst() {
    let config = resolve_config(None, &overrides(&["seq", "1", "100"])).unwrap();
    let (stdout, stdout_reader) = console_pipe();
    let (stderr, _stderr_reader) = console_pipe();
    let console = Console {
        stdout,
        stderr,
        prefix: false,
    };

    let code = run_with_timeout(
        Duration::from_secs(10),
        run_process(config, console, None::<DuplexStream>, std::future::pending()),
    )
    .await
    .unwrap();

    assert_eq!(code, 0);
    let expected: String = (1..=100).map(|i| format!("{}\n", i)).collect();
    assert_eq!(read_all(stdout_reader).await, expected);
}

#[tokio::test]
async fn test_run_forwards_input() {
    let mut flags = overrides(&["head", "-n", "2"]);
    flags.stdin = true;
    let config = resolve_config(None, &flags).unwrap();
    let (stdout, stdout_reader) = console_pipe();
    let (stderr, _stderr_reader) = console_pipe();
    let console = Console {
        stdout,
        stderr,
        prefix: false,
    };

    let code = run_with_timeout(
        Duration::from_secs(10),
        run_process(config, console, Some(&b"first\nsecond\nthird\n"[..]), std::future::pending()),
    )
    .await
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(read_all(stdout_reader).await, "first\nsecond\n");
}

#[tokio::test]
async fn test_shutdown_terminates_child() {
    let config = resolve_config(None, &overrides(&["sleep", "30"])).unwrap();
    let (stdout, _stdout_reader) = console_pipe();
    let (stderr, _stderr_reader) = console_pipe();
    let console = Console {
        stdout,
        stderr,
        prefix: false,
    };

    let code = run_with_timeout(
        Duration::from_secs(10),
        run_process(
            config,
            console,
            None::<DuplexStream>,
            tokio::time::sleep(Duration::from_millis(200)),
        ),
    )
    .await
    .unwrap();

    assert_eq!(code, 128 + procfan_core::Signal::SIGTERM as i32);
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let config = resolve_config(None, &overrides(&["nonexistent_command_12345"])).unwrap();
    let (stdout, _r1) = console_pipe();
    let (stderr, _r2) = console_pipe();
    let console = Console {
        stdout,
        stderr,
        prefix: false,
    };
    let err = run_process(config, console, None::<DuplexStream>, std::future::pending())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CLI004");
}
