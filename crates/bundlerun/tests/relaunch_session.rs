#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Indirect launches through a stand-in `open` tool: stdio crosses named
//! pipes, the exit code comes back and the pipes are gone afterwards.

mod common;

use std::ffi::OsString;
use std::io::Cursor;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use bundlerun::{BundleTarget, Launcher, StdioStreams};
use bundlerun_core::RelaunchConfig;

fn config(open_program: &Path, pipe_dir: &Path) -> RelaunchConfig {
    RelaunchConfig {
        open_program: open_program.to_path_buf(),
        pipe_dir: Some(pipe_dir.to_path_buf()),
        forward_signals: false,
        terminate_grace_secs: 1,
        ..RelaunchConfig::default()
    }
}

async fn read_all(mut stream: DuplexStream) -> String {
    let mut out = String::new();
    stream.read_to_string(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn stdio_round_trips_through_the_bundle() {
    let tools = tempfile::tempdir().unwrap();
    let pipes = tempfile::tempdir().unwrap();
    let open = common::write_fake_open(tools.path());
    let app = common::write_bundle(
        tools.path(),
        "Echo",
        r#"echo "args:$*"
echo "marker:$BUNDLERUN_NO_RELAUNCH" >&2
cat
exit 3"#,
    );

    let (stdout_tx, stdout_rx) = tokio::io::duplex(64 * 1024);
    let (stderr_tx, stderr_rx) = tokio::io::duplex(64 * 1024);
    let stdio = StdioStreams {
        stdin: Box::new(Cursor::new(b"hello through the pipe\n".to_vec())),
        stdout: Box::new(stdout_tx),
        stderr: Box::new(stderr_tx),
    };

    let launcher = Launcher::new(config(&open, pipes.path()));
    let target = BundleTarget::from_app(&app);
    let args = [OsString::from("one"), OsString::from("--two")];
    let code = launcher
        .relaunch_session(
            &CancellationToken::new(),
            &target.app_path,
            &target.executable,
            &args,
            stdio,
        )
        .await
        .unwrap();

    assert_eq!(code, 3);
    assert_eq!(
        read_all(stdout_rx).await,
        "args:one --two\nhello through the pipe\n"
    );
    assert_eq!(read_all(stderr_rx).await, "marker:1\n");
    assert!(common::dir_is_empty(pipes.path()));
}

#[tokio::test]
async fn large_output_is_delivered_in_order() {
    let tools = tempfile::tempdir().unwrap();
    let pipes = tempfile::tempdir().unwrap();
    let open = common::write_fake_open(tools.path());
    let app = common::write_bundle(tools.path(), "Counter", "seq 1 20000");

    let (stdout_tx, stdout_rx) = tokio::io::duplex(8 * 1024);
    let reader = tokio::spawn(read_all(stdout_rx));
    let stdio = StdioStreams {
        stdin: Box::new(tokio::io::empty()),
        stdout: Box::new(stdout_tx),
        stderr: Box::new(tokio::io::sink()),
    };

    let launcher = Launcher::new(config(&open, pipes.path()));
    let target = BundleTarget::from_app(&app);
    let code = launcher
        .relaunch_session(
            &CancellationToken::new(),
            &target.app_path,
            &target.executable,
            &[],
            stdio,
        )
        .await
        .unwrap();

    assert_eq!(code, 0);
    let expected: String = (1..=20000).map(|n| format!("{n}\n")).collect();
    assert_eq!(reader.await.unwrap(), expected);
    assert!(common::dir_is_empty(pipes.path()));
}

#[tokio::test]
async fn app_that_never_opens_the_pipes_does_not_hang() {
    let tools = tempfile::tempdir().unwrap();
    let pipes = tempfile::tempdir().unwrap();
    let open = tools.path().join("open");
    std::fs::write(&open, "#!/bin/sh\nexit 5\n").unwrap();
    std::fs::set_permissions(&open, std::fs::Permissions::from_mode(0o755)).unwrap();

    let stdio = StdioStreams {
        stdin: Box::new(Cursor::new(b"unread".to_vec())),
        stdout: Box::new(tokio::io::sink()),
        stderr: Box::new(tokio::io::sink()),
    };
    let launcher = Launcher::new(config(&open, pipes.path()));

    let started = Instant::now();
    let code = launcher
        .relaunch_session(
            &CancellationToken::new(),
            Path::new("/Applications/Nothing.app"),
            Path::new("/Applications/Nothing.app/Contents/MacOS/Nothing"),
            &[],
            stdio,
        )
        .await
        .unwrap();

    assert_eq!(code, 5);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(common::dir_is_empty(pipes.path()));
}
