//! End-to-end tests for the worker pool.
//!
//! These exercise the full parent/child path: real forked children, the
//! IPC channel, load-balanced dispatch and supervisor-driven restart.

use std::collections::HashSet;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};

use fpool::{Controller, ControllerConfig, Message};

const TEST_PAYLOAD: &[u8] = b"this is a test message";

/// Reply with `cmd + 1` and the fixed test payload, echoing the id.
fn echo(request: &Message) -> Message {
    let mut reply = Message::with_size(TEST_PAYLOAD.len() as u64);
    reply.header.id = request.header.id;
    reply.header.cmd = request.header.cmd + 1;
    reply.data_mut().copy_from_slice(TEST_PAYLOAD);
    reply
}

/// Like [`echo`], but slow enough that queues stay populated.
fn slow_echo(request: &Message) -> Message {
    std::thread::sleep(Duration::from_millis(20));
    echo(request)
}

fn schedule(ctl: &Controller, cmd: i32, id: u64, tx: &mpsc::Sender<Message>) {
    let mut msg = Message::new();
    msg.header.cmd = cmd;
    msg.header.id = id;
    let tx = tx.clone();
    ctl.schedule(
        msg,
        Box::new(move |reply| {
            let _ = tx.send(reply);
        }),
    );
}

#[test]
fn test_ping_roundtrip() {
    let ctl = Controller::new(1, echo).unwrap();
    let (tx, rx) = mpsc::channel();

    schedule(&ctl, 0, 0, &tx);

    let reply = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(reply.header.status, 0);
    assert_eq!(reply.header.cmd, 1);
    assert_eq!(reply.header.size, TEST_PAYLOAD.len() as u64);
    assert_eq!(reply.data(), TEST_PAYLOAD);
}

#[test]
fn test_every_completion_fires_exactly_once() {
    const COUNT: u64 = 100;

    let ctl = Controller::new(2, echo).unwrap();
    let (tx, rx) = mpsc::channel();

    for id in 0..COUNT {
        schedule(&ctl, id as i32, id, &tx);
    }
    drop(tx);

    let mut ids = HashSet::new();
    for _ in 0..COUNT {
        let reply = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(reply.header.status, 0);
        assert!(ids.insert(reply.header.id), "id completed twice");
    }
    assert_eq!(ids.len() as u64, COUNT);
    // Nothing fired more than once.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_killed_child_is_replaced_in_place() {
    let ctl = Controller::new(1, echo).unwrap();
    let (tx, rx) = mpsc::channel();

    // Complete one message so nothing is in flight when the child dies.
    schedule(&ctl, 0, 0, &tx);
    rx.recv_timeout(Duration::from_secs(3)).unwrap();

    let pids = ctl.pids();
    assert_eq!(pids.len(), 1);
    let old_pid = pids[0];

    kill(old_pid, Signal::SIGTERM).unwrap();

    // The supervisor should reap and respawn without shrinking the pool.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let pids = ctl.pids();
        if pids.len() == 1 && pids[0] != old_pid {
            break;
        }
        assert!(Instant::now() < deadline, "worker was not replaced: {pids:?}");
        std::thread::sleep(Duration::from_millis(10));
    }

    let stats = ctl.stats();
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.total_restarts, 1);

    schedule(&ctl, 1, 1, &tx);
    let reply = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(reply.header.status, 0);
    assert_eq!(reply.header.cmd, 2);
    assert_eq!(reply.data(), TEST_PAYLOAD);
}

#[test]
fn test_dispatch_balances_two_workers() {
    const COUNT: u64 = 100;

    let config = ControllerConfig {
        workers: 2,
        ..ControllerConfig::default()
    };
    let ctl = Controller::with_config(config, slow_echo).unwrap();
    let (tx, rx) = mpsc::channel();

    for id in 0..COUNT {
        schedule(&ctl, id as i32, id, &tx);
    }
    drop(tx);

    // Back-to-back argmin dispatch keeps the two queues close; only a
    // handful of messages can have drained during the scheduling loop.
    let stats = ctl.stats();
    assert_eq!(stats.queue_lens.len(), 2);
    let max = *stats.queue_lens.iter().max().unwrap();
    let min = *stats.queue_lens.iter().min().unwrap();
    assert!(
        max - min <= 4,
        "queues diverged: {:?}",
        stats.queue_lens
    );

    let mut ids = HashSet::new();
    for _ in 0..COUNT {
        let reply = rx.recv_timeout(Duration::from_secs(30)).unwrap();
        assert_eq!(reply.header.status, 0);
        assert!(ids.insert(reply.header.id));
    }
    assert_eq!(ids.len() as u64, COUNT);
}

#[test]
fn test_shutdown_fails_pending_messages_exactly_once() {
    const COUNT: u64 = 10;

    let ctl = Controller::new(1, slow_echo).unwrap();
    let (tx, rx) = mpsc::channel();

    for id in 0..COUNT {
        schedule(&ctl, id as i32, id, &tx);
    }
    drop(tx);
    drop(ctl);

    // Every accepted message completes: some with replies, the rest with
    // a negative shutdown status, none twice.
    let mut ids = HashSet::new();
    for _ in 0..COUNT {
        let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        if reply.header.status != 0 {
            assert!(reply.header.status < 0);
            assert_eq!(reply.header.size, 0);
        }
        assert!(ids.insert(reply.header.id));
    }
    assert_eq!(ids.len() as u64, COUNT);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}
