//! Integration tests for waiting on mailboxes

use agent_message_queue_core::config::{QueueConfig, WatchConfig};
use agent_message_queue_core::schema::{Header, Message, message_filename, new_message_id};
use agent_message_queue_core::watch::{BatchEnd, WatchMode, WatchOptions};
use agent_message_queue_core::{CancelToken, MailQueue, WaitOutcome, Watcher};
use chrono::Utc;
use std::ops::ControlFlow;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn send(queue: &MailQueue, from: &str, to: &str) -> String {
    let msg = Message {
        header: Header {
            schema: 1,
            id: new_message_id(Utc::now()),
            from: from.to_string(),
            to: vec![to.to_string()],
            thread: format!("p2p/{from}__{to}"),
            ..Default::default()
        },
        body: "ping".to_string(),
    };
    assert!(queue.send(&msg).unwrap().is_complete());
    msg.header.id
}

fn queue_with(temp_dir: &TempDir, force_poll: bool) -> MailQueue {
    let config = QueueConfig {
        watch: WatchConfig {
            poll_interval_ms: 25,
            force_poll,
            ..Default::default()
        },
        ..Default::default()
    };
    MailQueue::with_config(temp_dir.path(), config)
}

fn in_secs(secs: u64) -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(secs))
}

#[test]
fn test_existing_returns_without_waiting() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with(&temp_dir, false);
    let id = send(&queue, "alice", "bob");
    let watcher = queue.watcher("bob").unwrap();

    let start = Instant::now();
    let outcome = watcher.wait(in_secs(10), &CancelToken::new()).unwrap();

    assert!(start.elapsed() < Duration::from_millis(50));
    match outcome {
        WaitOutcome::Existing(entries) => assert_eq!(entries[0].id, id),
        other => panic!("expected existing, got {other:?}"),
    }
}

#[test]
fn test_new_message_both_backends() {
    for force_poll in [false, true] {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue_with(&temp_dir, force_poll);
        let watcher = queue.watcher("bob").unwrap();

        let sender = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(80));
                send(&queue, "alice", "bob")
            })
        };
        let outcome = watcher.wait(in_secs(10), &CancelToken::new()).unwrap();
        let id = sender.join().unwrap();

        match outcome {
            WaitOutcome::NewMessage(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].id, id);
                assert!(entries[0].is_valid());
            }
            other => panic!("expected new message (force_poll={force_poll}), got {other:?}"),
        }
    }
}

#[test]
fn test_timeout_never_early() {
    for force_poll in [false, true] {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue_with(&temp_dir, force_poll);
        let watcher = queue.watcher("bob").unwrap();
        let deadline = Instant::now() + Duration::from_millis(150);

        let outcome = watcher.wait(Some(deadline), &CancelToken::new()).unwrap();

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(Instant::now() >= deadline);
    }
}

#[test]
fn test_a_to_b_then_timeout() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with(&temp_dir, false);
    let watcher = queue.watcher("bob").unwrap();

    let sender = {
        let queue = queue.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            send(&queue, "alice", "bob")
        })
    };
    let outcome = watcher.wait(in_secs(10), &CancelToken::new()).unwrap();
    let id = sender.join().unwrap();

    let entries = match outcome {
        WaitOutcome::NewMessage(entries) => entries,
        other => panic!("expected new message, got {other:?}"),
    };
    assert_eq!(entries[0].id, id);

    let cur = queue.promote("bob", &entries[0].filename).unwrap();
    assert_eq!(cur, queue.layout().inbox_cur("bob").join(message_filename(&id)));

    let again = watcher
        .wait(Some(Instant::now() + Duration::from_millis(100)), &CancelToken::new())
        .unwrap();
    assert_eq!(again, WaitOutcome::TimedOut);
}

#[test]
fn test_cancel_from_another_thread() {
    let temp_dir = TempDir::new().unwrap();
    let queue = queue_with(&temp_dir, false);
    let watcher = queue.watcher("bob").unwrap();
    let token = CancelToken::new();

    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        })
    };
    let start = Instant::now();
    let outcome = watcher.wait(None, &token).unwrap();
    canceller.join().unwrap();

    assert_eq!(outcome, WaitOutcome::Cancelled);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_burst_coalesced_into_one_batch() {
    for mode in [WatchMode::Auto, WatchMode::Poll] {
        let temp_dir = TempDir::new().unwrap();
        let queue = MailQueue::new(temp_dir.path());
        let dir = queue.layout().inbox_new("bob");
        std::fs::create_dir_all(&dir).unwrap();
        let options = WatchOptions {
            mode,
            poll_interval: Duration::from_millis(25),
            debounce: Duration::from_millis(200),
            ..Default::default()
        };
        let watcher = Watcher::new(&dir, options);

        let sender = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                for _ in 0..5 {
                    send(&queue, "alice", "bob");
                    thread::sleep(Duration::from_millis(20));
                }
            })
        };

        let mut batches = Vec::new();
        let end = watcher
            .run_batches(in_secs(10), &CancelToken::new(), |batch| {
                let drained = queue.consume("bob", batch, false);
                batches.push(drained.len());
                if batches.iter().sum::<usize>() >= 5 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        sender.join().unwrap();

        assert_eq!(end, BatchEnd::Stopped);
        assert_eq!(batches, vec![5], "mode {mode:?}");
        assert_eq!(std::fs::read_dir(queue.layout().inbox_cur("bob")).unwrap().count(), 5);
    }
}
