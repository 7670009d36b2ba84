//! Control signals delivered to the test process itself.
//!
//! Signals are process-wide, so everything lives in one test in its own
//! binary.


use std::time::Duration;

use nix::sys::signal::{Signal, raise};

use drms::exit::ExitStatus;
use drms::shutdown::{ControlSignals, ShutdownState};

use server_support::{TestServer, count_rows, eventually, recorded_status};

#[tokio::test(flavor = "multi_thread")]
async fn test_control_signals_end_the_session() {
    // SIGUSR1 commits.
    let signals = ControlSignals::install().unwrap();
    let server = TestServer::start().await;
    let _forwarder = server.app().forward_signals(signals);

    let mut client = server.connect().await;
    client.query("CREATE TABLE t (id INTEGER)").await.unwrap();
    client.query("INSERT INTO t VALUES (1)").await.unwrap();
    client.terminate().await.unwrap();

    raise(Signal::SIGUSR1).unwrap();
    let (status, dir, _) = server.finish().await;
    assert_eq!(status, ExitStatus::Committed);
    assert_eq!(count_rows(&dir.path().join("drms.db"), "t"), 1);
    assert_eq!(recorded_status(&dir.path().join("drms_status.db")), "committed");

    // SIGTERM caught after the announcement is written but before anything
    // forwards it neither kills the process nor gets lost.
    let signals = ControlSignals::install().unwrap();
    let server = TestServer::start().await;
    let announcement = server.app().announcement_path().to_path_buf();
    assert!(announcement.is_file());

    raise(Signal::SIGTERM).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.app().shutdown_handle().observe(), ShutdownState::Uninitiated);
    assert!(announcement.is_file());

    let _forwarder = server.app().forward_signals(signals);
    let handle = server.app().shutdown_handle();
    assert!(eventually(|| handle.observe() == ShutdownState::AbortRequested).await);

    let (status, dir, events) = server.finish().await;
    assert_eq!(status, ExitStatus::Aborted);
    assert!(events.position("commit").is_none());
    assert!(!announcement.exists());
    assert_eq!(recorded_status(&dir.path().join("drms_status.db")), "aborted");
}
