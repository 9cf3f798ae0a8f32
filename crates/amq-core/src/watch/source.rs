//! Change sources feeding the watch loop
//!
//! Two interchangeable backends: OS change notifications through `notify`,
//! and fixed-interval rescans. Both report into one channel that the watch
//! loop multiplexes with cancellation and its own timers.

use crate::io::error::QueueError;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::Path;
use std::sync::mpsc::Sender;
use std::time::Duration;
use tracing::{debug, warn};

/// Shortest interval a poll backend will rescan at
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Message delivered to the watch loop
#[derive(Debug)]
pub(crate) enum Signal {
    Fs(notify::Result<Event>),
    Cancel,
}

/// Requested backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// Change notifications, falling back to polling if unavailable
    #[default]
    Auto,
    /// Change notifications only; failure to subscribe is an error
    Events,
    /// Fixed-interval rescans (network filesystems)
    Poll,
}

/// Backend actually serving a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Events,
    Poll,
}

pub(crate) trait ChangeSource {
    fn backend(&self) -> Backend;

    /// How long the loop may block before it must rescan on its own.
    /// `None` means only signals trigger a rescan.
    fn tick(&self) -> Option<Duration>;
}

struct EventSource {
    _watcher: RecommendedWatcher,
}

impl EventSource {
    fn open(dir: &Path, tx: Sender<Signal>) -> Result<Self, QueueError> {
        let notify_err = |source| QueueError::Notify {
            path: dir.to_path_buf(),
            source,
        };
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(Signal::Fs(res));
            },
            notify::Config::default(),
        )
        .map_err(notify_err)?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(notify_err)?;
        debug!(dir = %dir.display(), "subscribed to change notifications");
        Ok(Self { _watcher: watcher })
    }
}

impl ChangeSource for EventSource {
    fn backend(&self) -> Backend {
        Backend::Events
    }

    fn tick(&self) -> Option<Duration> {
        None
    }
}

struct PollSource {
    interval: Duration,
}

impl ChangeSource for PollSource {
    fn backend(&self) -> Backend {
        Backend::Poll
    }

    fn tick(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

/// Subscribe to changes in `dir` with the requested backend.
///
/// Subscription happens before the caller's first scan, so anything that
/// lands in between still produces a signal.
pub(crate) fn open_source(
    dir: &Path,
    mode: WatchMode,
    poll_interval: Duration,
    tx: Sender<Signal>,
) -> Result<Box<dyn ChangeSource>, QueueError> {
    let poll = || -> Box<dyn ChangeSource> {
        Box::new(PollSource {
            interval: poll_interval.max(MIN_POLL_INTERVAL),
        })
    };
    match mode {
        WatchMode::Poll => Ok(poll()),
        WatchMode::Events => Ok(Box::new(EventSource::open(dir, tx)?)),
        WatchMode::Auto => match EventSource::open(dir, tx) {
            Ok(source) => Ok(Box::new(source)),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "change notifications unavailable, falling back to polling");
                Ok(poll())
            }
        },
    }
}

/// Whether `event` may mean a new entry appeared.
///
/// Maildir delivery lands by rename, which backends report either as a
/// create or as a name change.
pub(crate) fn is_arrival(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};
    use std::sync::mpsc::channel;
    use tempfile::TempDir;

    #[test]
    fn test_is_arrival() {
        assert!(is_arrival(&Event::new(EventKind::Create(CreateKind::File))));
        assert!(is_arrival(&Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))));
        assert!(!is_arrival(&Event::new(EventKind::Remove(RemoveKind::File))));
        assert!(!is_arrival(&Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))));
    }

    #[test]
    fn test_poll_mode() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, _rx) = channel();
        let source = open_source(temp_dir.path(), WatchMode::Poll, Duration::from_millis(20), tx).unwrap();
        assert_eq!(source.backend(), Backend::Poll);
        assert_eq!(source.tick(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, _rx) = channel();
        let source = open_source(temp_dir.path(), WatchMode::Poll, Duration::ZERO, tx).unwrap();
        assert_eq!(source.tick(), Some(MIN_POLL_INTERVAL));
    }

    #[test]
    fn test_events_mode_missing_dir_errors() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, _rx) = channel();
        let missing = temp_dir.path().join("nope");
        assert!(matches!(
            open_source(&missing, WatchMode::Events, Duration::from_millis(20), tx),
            Err(QueueError::Notify { .. })
        ));
    }

    #[test]
    fn test_auto_falls_back_to_poll() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, _rx) = channel();
        let missing = temp_dir.path().join("nope");
        let source = open_source(&missing, WatchMode::Auto, Duration::from_millis(20), tx).unwrap();
        assert_eq!(source.backend(), Backend::Poll);
    }
}
