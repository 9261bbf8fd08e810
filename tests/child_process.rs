//! End-to-end child process scenarios.
//!
//! These tests drive the real pipeline: controller, `leash-spawner` helper,
//! rights-message handshake, and watcher cleanup, against stock Unix tools
//! (`cat`, `sh`, `false`).
//!
//! Run with: `cargo test --test child_process`

mod common {
    pub fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }
}

/// Phase tracking macro for structured test logging.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Assertion with logging for better test output.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

use leash::{Command, Error, ReadResult, SignalKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

fn init_test(name: &str) {
    common::init_test_logging();
    test_phase!(name);
}

fn spawner_path() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_leash-spawner"))
}

fn command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.spawner_path(spawner_path());
    cmd
}

fn shell(script: &str) -> Command {
    let mut cmd = command("sh");
    cmd.arg("-c").arg(script);
    cmd
}

/// Fresh directory for tests that assert on socket leftovers.
fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("leash-e2e-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}

fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[test]
fn e1_cat_roundtrip_eof_and_exit() {
    init_test("e1_cat_roundtrip_eof_and_exit");
    let child = command("cat").spawn().expect("spawn cat");

    child.write(b"hello").expect("write");
    child.close_stdin().expect("close stdin");

    let got = child.read(5).expect("read 5");
    assert_with_log!(
        got == ReadResult::Complete(b"hello".to_vec()),
        "echoed bytes",
        "hello",
        got
    );

    let eof = child.read(1).expect("read at eof");
    assert_with_log!(eof == ReadResult::Eof(Vec::new()), "clean eof", "Eof([])", eof);

    let status = child.wait(None).expect("wait");
    assert_with_log!(status.success(), "exit 0", true, status);
}

#[test]
fn e2_wait_times_out_then_delivers_code() {
    init_test("e2_wait_times_out_then_delivers_code");
    let child = shell("sleep 1; exit 7").spawn().expect("spawn");

    let err = child
        .wait(Some(Duration::from_millis(100)))
        .expect_err("deadline must fire first");
    assert_with_log!(matches!(err, Error::WaitTimeout), "timeout", "WaitTimeout", err);

    let status = child.wait(None).expect("wait");
    assert_with_log!(status.code() == Some(7), "exit code", Some(7), status.code());
}

#[test]
fn e3_kill_unblocks_pending_read_with_eof() {
    init_test("e3_kill_unblocks_pending_read_with_eof");
    let child = shell("printf AB; sleep 10").spawn().expect("spawn");

    std::thread::scope(|scope| {
        let reader = scope.spawn(|| child.read(4));

        // Let the child produce its two bytes and the reader go pending.
        std::thread::sleep(Duration::from_millis(300));
        child.kill(SignalKind::Kill).expect("kill");

        let got = reader.join().expect("reader thread").expect("read result");
        assert_with_log!(
            got == ReadResult::Eof(b"AB".to_vec()),
            "partial bytes at eof",
            "Eof(AB)",
            got
        );
    });

    let status = child.wait(None).expect("wait");
    assert_with_log!(!status.success(), "non-zero status", false, status);
    assert_with_log!(
        status.signal() == Some(SignalKind::Kill.as_raw_value()),
        "killed by SIGKILL",
        Some(9),
        status.signal()
    );
}

#[test]
fn e4_exactly_one_write_in_flight_and_backpressure_roundtrip() {
    init_test("e4_exactly_one_write_in_flight_and_backpressure_roundtrip");
    let child = command("cat").spawn().expect("spawn cat");

    // Much larger than the pipe capacity, so the first write stays in flight
    // until the reader drains cat's output.
    let payload = vec![0x42u8; 4 * 1024 * 1024];

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| child.write(&payload));

        std::thread::sleep(Duration::from_millis(200));
        let second = child.write(b"x").expect_err("second write must be rejected");
        assert_with_log!(
            matches!(second, Error::PendingWrite),
            "single write in flight",
            "PendingWrite",
            second
        );

        // Drain everything cat echoes; this releases the pending writer.
        let mut received = Vec::with_capacity(payload.len());
        while received.len() < payload.len() {
            let chunk = child
                .read(payload.len() - received.len())
                .expect("read chunk");
            let at_eof = chunk.is_eof();
            received.extend_from_slice(chunk.bytes());
            if at_eof {
                break;
            }
        }
        assert_with_log!(
            received == payload,
            "byte-exact roundtrip",
            payload.len(),
            received.len()
        );

        writer
            .join()
            .expect("writer thread")
            .expect("first write succeeds");
    });

    child.close_stdin().expect("close stdin");
    let eof = child.read(1).expect("read at eof");
    assert_with_log!(eof.is_eof(), "eof after close", true, eof);
    let status = child.wait(None).expect("wait");
    assert_with_log!(status.success(), "exit 0", true, status);
}

#[test]
fn e5_operations_after_exit_report_the_code() {
    init_test("e5_operations_after_exit_report_the_code");
    let child = command("false").spawn().expect("spawn false");

    let status = child.wait(None).expect("wait");
    assert_with_log!(status.code() == Some(1), "exit 1", Some(1), status.code());

    let err = child.write(b"x").expect_err("write after exit");
    let carries_code = matches!(err, Error::Exited(st) if st.code() == Some(1));
    assert_with_log!(carries_code, "write reports exit", "Exited(1)", err);

    // A second wait still answers immediately with the captured code.
    let again = child.wait(Some(Duration::from_millis(10))).expect("wait again");
    assert_with_log!(again.code() == Some(1), "captured code", Some(1), again.code());
}

#[test]
fn e6_unknown_command_fails_without_leaving_a_socket() {
    init_test("e6_unknown_command_fails_without_leaving_a_socket");
    let dir = scratch_dir("e6");

    let err = command("leash-no-such-command-xyzzy")
        .temp_dir(&dir)
        .spawn()
        .expect_err("must fail");
    let not_found = matches!(&err, Error::CommandNotFound(name) if name.contains("xyzzy"));
    assert_with_log!(not_found, "command not found", "CommandNotFound", err);

    let leftovers = dir_entries(&dir);
    assert_with_log!(leftovers.is_empty(), "no socket file", "[]", leftovers);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn unbuffered_read_returns_first_chunk() {
    init_test("unbuffered_read_returns_first_chunk");
    let child = shell("printf AB; sleep 5").spawn().expect("spawn");

    let got = child.read_unbuffered().expect("unbuffered read");
    assert_with_log!(
        got == ReadResult::Complete(b"AB".to_vec()),
        "first chunk",
        "AB",
        got
    );

    child.kill(SignalKind::Kill).expect("kill");
    let status = child.wait(None).expect("wait");
    assert_with_log!(!status.success(), "killed", false, status);
}

#[test]
fn second_read_is_rejected_while_one_is_pending() {
    init_test("second_read_is_rejected_while_one_is_pending");
    let child = shell("sleep 2").spawn().expect("spawn");

    std::thread::scope(|scope| {
        let reader = scope.spawn(|| child.read(1));

        std::thread::sleep(Duration::from_millis(100));
        let second = child.read(1).expect_err("second read must be rejected");
        assert_with_log!(
            matches!(second, Error::PendingRead),
            "single read in flight",
            "PendingRead",
            second
        );

        child.kill(SignalKind::Kill).expect("kill");
        let got = reader.join().expect("reader thread").expect("read");
        assert_with_log!(got == ReadResult::Eof(Vec::new()), "eof", "Eof([])", got);
    });

    child.wait(None).expect("wait");
}

#[test]
fn zero_sized_read_is_invalid() {
    init_test("zero_sized_read_is_invalid");
    let child = command("cat").spawn().expect("spawn cat");
    let err = child.read(0).expect_err("zero read");
    assert_with_log!(
        matches!(err, Error::InvalidReadSize),
        "invalid size",
        "InvalidReadSize",
        err
    );
    child.close_stdin().expect("close stdin");
    child.wait(None).expect("wait");
}

#[test]
fn exit_fans_out_to_every_waiter() {
    init_test("exit_fans_out_to_every_waiter");
    let child = shell("sleep 0.3; exit 5").spawn().expect("spawn");

    std::thread::scope(|scope| {
        let waiters: Vec<_> = (0..3).map(|_| scope.spawn(|| child.wait(None))).collect();
        for waiter in waiters {
            let status = waiter.join().expect("waiter thread").expect("wait");
            assert_with_log!(status.code() == Some(5), "fanned out code", Some(5), status.code());
        }
    });
}

#[test]
fn timed_out_waiter_does_not_disturb_the_others() {
    init_test("timed_out_waiter_does_not_disturb_the_others");
    let child = shell("sleep 0.5; exit 3").spawn().expect("spawn");

    std::thread::scope(|scope| {
        let patient = scope.spawn(|| child.wait(None));

        let err = child
            .wait(Some(Duration::from_millis(50)))
            .expect_err("short deadline fires");
        assert_with_log!(matches!(err, Error::WaitTimeout), "timeout once", "WaitTimeout", err);

        let status = patient.join().expect("patient thread").expect("wait");
        assert_with_log!(status.code() == Some(3), "unaffected waiter", Some(3), status.code());
    });
}

#[test]
fn write_after_close_stdin_fails() {
    init_test("write_after_close_stdin_fails");
    let child = command("cat").spawn().expect("spawn cat");

    child.close_stdin().expect("close");
    child.close_stdin().expect("close is idempotent");

    let err = child.write(b"late").expect_err("write after close");
    assert_with_log!(
        matches!(err, Error::StdinClosed),
        "stdin closed",
        "StdinClosed",
        err
    );

    let status = child.wait(None).expect("wait");
    assert_with_log!(status.success(), "cat exits cleanly", true, status);
}

#[test]
fn close_stdin_fails_a_pending_writer() {
    init_test("close_stdin_fails_a_pending_writer");
    // The script never reads stdin, so a large write stays pending.
    let child = shell("sleep 5").spawn().expect("spawn");
    let payload = vec![7u8; 4 * 1024 * 1024];

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| child.write(&payload));

        std::thread::sleep(Duration::from_millis(200));
        child.close_stdin().expect("close stdin");

        let err = writer
            .join()
            .expect("writer thread")
            .expect_err("pending writer must fail");
        assert_with_log!(
            matches!(err, Error::StdinClosed),
            "pending writer closed",
            "StdinClosed",
            err
        );
    });

    child.kill(SignalKind::Kill).expect("kill");
    child.wait(None).expect("wait");
}

#[test]
fn env_and_cwd_reach_the_target() {
    init_test("env_and_cwd_reach_the_target");
    let child = {
        let mut cmd = shell("printf '%s:%s' \"$LEASH_E2E_VAL\" \"$(pwd)\"");
        cmd.env("LEASH_E2E_VAL", "marker").current_dir("/tmp");
        cmd.spawn().expect("spawn")
    };

    let got = child.read(4096).expect("read");
    assert_with_log!(got.is_eof(), "output then eof", true, got);
    let text = String::from_utf8(got.into_bytes()).expect("utf8");
    assert_with_log!(
        text == "marker:/tmp",
        "env and cwd applied",
        "marker:/tmp",
        text
    );

    let status = child.wait(None).expect("wait");
    assert_with_log!(status.success(), "exit 0", true, status);
}

#[test]
fn os_pid_is_live_then_unknown_after_exit() {
    init_test("os_pid_is_live_then_unknown_after_exit");
    let child = shell("sleep 0.2").spawn().expect("spawn");

    let pid = child.os_pid().expect("pid while running");
    assert_with_log!(pid_alive(pid), "pid alive", true, pid);

    let status = child.wait(None).expect("wait");
    assert_with_log!(status.success(), "exit 0", true, status);

    let gone = child.os_pid();
    assert_with_log!(gone.is_none(), "pid unknown after exit", "None", gone);

    let err = child.kill(SignalKind::Terminate).expect_err("kill after exit");
    assert_with_log!(
        matches!(err, Error::ProcessNotAlive),
        "kill reports gone",
        "ProcessNotAlive",
        err
    );
}

#[test]
fn stop_reaps_the_child_and_removes_the_socket() {
    init_test("stop_reaps_the_child_and_removes_the_socket");
    let dir = scratch_dir("stop");
    let child = {
        let mut cmd = shell("sleep 30");
        cmd.temp_dir(&dir);
        cmd.spawn().expect("spawn")
    };

    let pid = child.os_pid().expect("pid while running");
    // The handshake socket is unlinked before the handle is observable.
    let leftovers = dir_entries(&dir);
    assert_with_log!(leftovers.is_empty(), "socket already gone", "[]", leftovers);

    child.stop();

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline && pid_alive(pid) {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_with_log!(!pid_alive(pid), "pid reaped after stop", false, pid_alive(pid));

    let err = child.wait(None).expect_err("controller released");
    assert_with_log!(
        matches!(err, Error::ControllerGone),
        "handle observes release",
        "ControllerGone",
        err
    );

    let leftovers = dir_entries(&dir);
    assert_with_log!(leftovers.is_empty(), "no leftovers", "[]", leftovers);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn handshake_times_out_when_the_helper_never_connects() {
    init_test("handshake_times_out_when_the_helper_never_connects");
    let dir = scratch_dir("hs");

    let start = Instant::now();
    let err = {
        let mut cmd = Command::new("cat");
        cmd.spawner_path("/bin/false").temp_dir(&dir);
        cmd.spawn().expect_err("handshake must fail")
    };
    let elapsed = start.elapsed();

    let timed_out = matches!(
        err,
        Error::Handshake(leash::HandshakeError::AcceptTimeout(_))
    );
    assert_with_log!(timed_out, "accept timeout", "AcceptTimeout", err);
    assert_with_log!(
        elapsed >= Duration::from_secs(2),
        "full deadline honoured",
        true,
        elapsed
    );

    let leftovers = dir_entries(&dir);
    assert_with_log!(leftovers.is_empty(), "socket removed on failure", "[]", leftovers);
    let _ = std::fs::remove_dir_all(&dir);
}
