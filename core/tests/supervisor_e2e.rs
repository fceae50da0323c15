//! End-to-end tests for the process supervisor
//!
//! These tests run real `/bin/sh` children and verify that:
//! - Output lines reach every subscriber in order and streams close at EOF
//! - Input subscribers are written to the child's stdin without interleaving
//! - Terminate/Kill stop the child and respect the maximum wait
//! - Slow subscribers lose chunks instead of stalling the others

#![cfg(unix)]

use procfan_core::{Lifecycle, ProcError, Process, ProcessConfig, Stream, EXIT_CODE_UNKNOWN};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

fn sh(script: &str) -> ProcessConfig {
    ProcessConfig::new("/bin/sh").args(["-c", script])
}

/// Drain a stream until it closes
fn collect(stream: Arc<Stream>) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = Vec::new();
        while let Some(chunk) = stream.recv().await {
            lines.push(String::from_utf8(chunk).unwrap());
        }
        lines
    })
}

/// Lines must be "0", "1", "2", ... with nothing skipped
fn assert_counting_prefix(lines: &[String]) {
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line, &i.to_string());
    }
}

#[tokio::test]
async fn test_echo_single_chunk_then_closed() {
    let process = Process::new(ProcessConfig::new("echo").arg("hello world").stdout()).unwrap();
    let out = process.bind_stdout("out").unwrap();
    process.start().unwrap();

    assert_eq!(out.recv().await.unwrap(), b"hello world");
    assert_eq!(out.recv().await, None);
    assert!(out.is_closed());

    process.wait().await.unwrap();
    assert_eq!(process.exit_code(), 0);
}

#[tokio::test]
async fn test_kill_long_running_with_two_subscribers() {
    let config = sh("i=0; while true; do echo $i; i=$((i+1)); sleep 0.01; done")
        .stdout()
        .process_group();
    let process = Process::new(config).unwrap();
    let a = collect(process.bind_stdout("a").unwrap());
    let b = collect(process.bind_stdout("b").unwrap());
    process.start().unwrap();
    assert!(process.is_running().unwrap());

    tokio::time::sleep(Duration::from_secs(5)).await;
    process.kill().await.unwrap();

    let a = a.await.unwrap();
    let b = b.await.unwrap();
    assert!(!a.is_empty());
    assert!(!b.is_empty());
    assert_counting_prefix(&a);
    assert_counting_prefix(&b);
    assert!(a.len().abs_diff(b.len()) <= 2);

    assert!(!process.is_running().unwrap());
    assert_eq!(process.exit_code(), EXIT_CODE_UNKNOWN);
    assert_eq!(process.lifecycle(), Lifecycle::Closed);
}

#[tokio::test]
async fn test_stdin_lines_then_clean_exit() {
    let script = r#"
i=0
while [ $i -lt 10 ]; do
    read line
    [ "$line" = "$i" ] || exit 1
    i=$((i+1))
done
read last
[ "$last" = exit ]
"#;
    let process = Process::new(sh(script).stdin()).unwrap();
    let input = process.bind_stdin("in").unwrap();
    process.start().unwrap();

    for i in 0..10 {
        input.send(format!("{}\n", i).into_bytes()).await.unwrap();
    }
    input.send(b"exit\n".to_vec()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), process.wait())
        .await
        .expect("child should exit on its own")
        .unwrap();
    assert_eq!(process.exit_code(), 0);
    assert!(!process.is_running().unwrap());
}

#[tokio::test]
async fn test_terminate_respects_max_wait() {
    let config = sh("trap '' TERM; exec sleep 30").max_wait(Duration::from_secs(1));
    let process = Process::new(config).unwrap();
    process.start().unwrap();

    let started = Instant::now();
    let err = process.terminate().await.unwrap_err();
    assert!(err.is_deadline_exceeded());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(process.is_running().unwrap());

    // the deadline may be reported again, the kill still lands
    if let Err(e) = process.kill().await {
        assert!(e.iter().all(|e| matches!(e, ProcError::DeadlineExceeded(_))));
    }
    assert!(!process.is_running().unwrap());
}

#[tokio::test]
async fn test_stdout_and_stderr_are_separate() {
    let process = Process::new(sh("echo out; echo err >&2; exit 4").stdout().stderr()).unwrap();
    let out = collect(process.bind_stdout("console").unwrap());
    let err = collect(process.bind_stderr("console").unwrap());
    process.start().unwrap();

    assert!(matches!(process.wait().await, Err(ProcError::ExitStatus { .. })));
    assert_eq!(out.await.unwrap(), vec!["out"]);
    assert_eq!(err.await.unwrap(), vec!["err"]);
    assert_eq!(process.exit_code(), 4);
}

#[tokio::test]
async fn test_input_subscribers_do_not_interleave() {
    let process = Process::new(ProcessConfig::new("head").args(["-n", "2"]).stdin().stdout()).unwrap();
    let first = process.bind_stdin("first").unwrap();
    let second = process.bind_stdin("second").unwrap();
    let out = collect(process.bind_stdout("out").unwrap());
    process.start().unwrap();

    let line = "x".repeat(4096);
    let (sent_first, sent_second) = tokio::join!(
        first.send(format!("{}1\n", line).into_bytes()),
        second.send(format!("{}2\n", line).into_bytes()),
    );
    sent_first.unwrap();
    sent_second.unwrap();

    process.wait().await.unwrap();
    let mut lines = out.await.unwrap();
    lines.sort();
    assert_eq!(lines, vec![format!("{}1", line), format!("{}2", line)]);
}

#[tokio::test]
async fn test_stalled_subscriber_loses_chunks_only() {
    let config = sh("printf 'a\\nb\\nc\\n'")
        .stdout()
        .send_timeout(Duration::from_millis(200));
    let process = Process::new(config).unwrap();
    let fast = collect(process.bind_stdout("fast").unwrap());
    let stalled = process.bind_stdout("stalled").unwrap();
    process.start().unwrap();

    let fast = tokio::time::timeout(Duration::from_secs(10), fast)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fast, vec!["a", "b", "c"]);
    assert!(stalled.is_closed());
    assert_eq!(stalled.try_recv(), None);
    process.wait().await.unwrap();
}

#[tokio::test]
async fn test_default_config_delivers_long_burst() {
    let process = Process::new(ProcessConfig::new("seq").args(["1", "200"]).stdout()).unwrap();
    let out = collect(process.bind_stdout("out").unwrap());
    process.start().unwrap();

    let lines = tokio::time::timeout(Duration::from_secs(10), out)
        .await
        .unwrap()
        .unwrap();
    let expected: Vec<String> = (1..=200).map(|i| i.to_string()).collect();
    assert_eq!(lines, expected);
    process.wait().await.unwrap();
}

#[tokio::test]
async fn test_stalled_subscriber_with_default_config() {
    let config = sh("i=0; while [ $i -lt 50 ]; do echo $i; i=$((i+1)); sleep 0.02; done").stdout();
    let process = Process::new(config).unwrap();
    let fast = process.bind_stdout("fast").unwrap();
    let stalled = process.bind_stdout("stalled").unwrap();
    process.start().unwrap();

    for i in 0..50 {
        let line = tokio::time::timeout(Duration::from_secs(10), fast.recv())
            .await
            .unwrap();
        assert_eq!(line, Some(i.to_string().into_bytes()));
    }
    process.wait().await.unwrap();

    process.terminate().await.unwrap();
    assert!(fast.is_closed());
    assert!(stalled.is_closed());
    assert_eq!(stalled.try_recv(), None);
}

#[tokio::test]
async fn test_disabled_directions_bind_nothing() {
    let process = Process::new(sh("exit 0").stdout()).unwrap();
    assert!(process.bind_stdin("in").is_none());
    assert!(process.bind_stderr("err").is_none());
    assert!(process.bind_stdout("out").is_some());
}

#[tokio::test]
async fn test_terminate_process_group() {
    let config = sh("sleep 30 & wait").stdout().process_group();
    let process = Process::new(config).unwrap();
    let out = collect(process.bind_stdout("out").unwrap());
    process.start().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    process.terminate().await.unwrap();
    assert!(!process.is_running().unwrap());
    assert!(out.await.unwrap().is_empty());
}

#[tokio::test]
#[should_panic(expected = "bind pipe after process started: in")]
async fn test_bind_stdin_after_start_panics() {
    let process = Process::new(sh("exit 0").stdin()).unwrap();
    process.start().unwrap();
    process.bind_stdin("in");
}

#[tokio::test]
#[should_panic(expected = "bind pipe after process started: out")]
async fn test_bind_stdout_after_start_panics() {
    let process = Process::new(sh("exit 0").stdout()).unwrap();
    process.start().unwrap();
    process.bind_stdout("out");
}

#[tokio::test]
#[should_panic(expected = "bind pipe after process started: err")]
async fn test_bind_stderr_after_start_panics() {
    let process = Process::new(sh("exit 0").stderr()).unwrap();
    process.start().unwrap();
    process.bind_stderr("err");
}
