//! Waiting for new mailbox entries
//!
//! A [`Watcher`] blocks the calling thread on a single loop that multiplexes
//! the change source, an optional deadline, a debounce timer and a
//! [`CancelToken`]. There is no background thread of its own; the `notify`
//! backend's callback only forwards events into the loop's channel.
//!
//! Subscription always happens before the first scan, so a delivery that
//! lands between the two still wakes the loop.

mod cancel;
mod scan;
mod source;

pub use cancel::CancelToken;
pub use scan::{InboxEntry, ScanFailure, scan_inbox};
pub use source::{Backend, MIN_POLL_INTERVAL, WatchMode};

use crate::config::WatchConfig;
use crate::io::error::{QueueError, at};
use crate::io::layout::validate_handle;
use crate::queue::MailQueue;
use crate::validate::{BasicValidator, HeaderValidator};
use cancel::Registration;
use source::{ChangeSource, Signal, is_arrival, open_source};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    pub mode: WatchMode,
    pub poll_interval: Duration,
    /// Pause after an arrival event before rescanning
    pub settle_delay: Duration,
    /// Window for coalescing arrivals in [`Watcher::run_batches`]
    pub debounce: Duration,
    /// Read message bodies while scanning
    pub include_body: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for WatchOptions {
    fn from(config: &WatchConfig) -> Self {
        Self {
            mode: if config.force_poll {
                WatchMode::Poll
            } else {
                WatchMode::Auto
            },
            poll_interval: config.poll_interval(),
            settle_delay: config.settle_delay(),
            debounce: config.debounce(),
            include_body: false,
        }
    }
}

/// How a [`Watcher::wait`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// Entries were already waiting when the watch started
    Existing(Vec<InboxEntry>),
    /// Entries arrived while waiting
    NewMessage(Vec<InboxEntry>),
    TimedOut,
    Cancelled,
}

/// How a [`Watcher::run_batches`] loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEnd {
    /// The callback asked to stop
    Stopped,
    TimedOut,
    Cancelled,
}

/// Watches one `inbox/new` directory
pub struct Watcher {
    dir: PathBuf,
    options: WatchOptions,
    validator: Box<dyn HeaderValidator + Send + Sync>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Watch `dir`, validating headers with [`BasicValidator`].
    pub fn new(dir: impl Into<PathBuf>, options: WatchOptions) -> Self {
        Self {
            dir: dir.into(),
            options,
            validator: Box::new(BasicValidator::new()),
        }
    }

    pub fn with_validator(mut self, validator: impl HeaderValidator + Send + Sync + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &WatchOptions {
        &self.options
    }

    /// One scan of the watched directory, oldest first.
    pub fn scan(&self) -> Result<Vec<InboxEntry>, QueueError> {
        scan_inbox(&self.dir, self.validator.as_ref(), self.options.include_body)
    }

    /// Wait until the directory holds at least one entry.
    ///
    /// Returns [`WaitOutcome::Existing`] without waiting if entries are
    /// already present. Reaching `deadline` yields [`WaitOutcome::TimedOut`],
    /// never earlier; `None` waits indefinitely. Errors are reserved for real
    /// failures: the event stream closing, a backend error, a failed scan.
    pub fn wait(&self, deadline: Option<Instant>, cancel: &CancelToken) -> Result<WaitOutcome, QueueError> {
        let session = self.subscribe(cancel)?;
        if cancel.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }

        let existing = self.scan()?;
        if !existing.is_empty() {
            return Ok(WaitOutcome::Existing(existing));
        }

        loop {
            match session.next(deadline)? {
                Wake::Deadline => return Ok(WaitOutcome::TimedOut),
                Wake::Cancelled => return Ok(WaitOutcome::Cancelled),
                Wake::Ignored => continue,
                Wake::Arrival => std::thread::sleep(self.options.settle_delay),
                Wake::Tick => {}
            }
            let found = self.scan()?;
            if !found.is_empty() {
                return Ok(WaitOutcome::NewMessage(found));
            }
        }
    }

    /// Drain-mode loop: hand batches of entries to `on_batch` until it breaks,
    /// the deadline passes or the token is cancelled.
    ///
    /// Entries already present form the first batch. After that, the first
    /// arrival opens a debounce window and everything that lands before it
    /// closes is delivered as one batch. Each batch is a fresh scan, so entries
    /// the callback leaves in place show up again in the next one.
    pub fn run_batches<F>(
        &self,
        deadline: Option<Instant>,
        cancel: &CancelToken,
        mut on_batch: F,
    ) -> Result<BatchEnd, QueueError>
    where
        F: FnMut(Vec<InboxEntry>) -> ControlFlow<()>,
    {
        let session = self.subscribe(cancel)?;
        if cancel.is_cancelled() {
            return Ok(BatchEnd::Cancelled);
        }

        let flush = |on_batch: &mut F| -> Result<ControlFlow<()>, QueueError> {
            let batch = self.scan()?;
            if batch.is_empty() {
                return Ok(ControlFlow::Continue(()));
            }
            debug!(dir = %self.dir.display(), count = batch.len(), "delivering batch");
            Ok(on_batch(batch))
        };

        if flush(&mut on_batch)?.is_break() {
            return Ok(BatchEnd::Stopped);
        }

        let mut window: Option<Instant> = None;
        loop {
            let until = match (deadline, window) {
                (Some(d), Some(w)) => Some(d.min(w)),
                (d, w) => d.or(w),
            };
            match session.next(until)? {
                Wake::Cancelled => return Ok(BatchEnd::Cancelled),
                Wake::Ignored => continue,
                Wake::Arrival => {
                    if window.is_none() {
                        window = Some(Instant::now() + self.options.debounce);
                    }
                    continue;
                }
                // A poll tick that finds entries counts as the first arrival
                Wake::Tick => {
                    if window.is_none() && !self.scan()?.is_empty() {
                        window = Some(Instant::now() + self.options.debounce);
                    }
                    continue;
                }
                Wake::Deadline => {
                    let window_closed = window.is_some_and(|w| Instant::now() >= w);
                    if !window_closed {
                        return Ok(BatchEnd::TimedOut);
                    }
                }
            }
            window = None;
            if flush(&mut on_batch)?.is_break() {
                return Ok(BatchEnd::Stopped);
            }
        }
    }

    fn subscribe(&self, cancel: &CancelToken) -> Result<Session, QueueError> {
        let (tx, rx) = channel();
        let registration = cancel.register(tx.clone());
        let source = open_source(&self.dir, self.options.mode, self.options.poll_interval, tx)?;
        debug!(dir = %self.dir.display(), backend = ?source.backend(), "watching");
        Ok(Session {
            dir: self.dir.clone(),
            rx,
            source,
            _registration: registration,
        })
    }
}

enum Wake {
    Arrival,
    /// Poll interval elapsed
    Tick,
    /// The `until` instant passed to [`Session::next`] was reached
    Deadline,
    Cancelled,
    /// Event that cannot signal a new entry
    Ignored,
}

struct Session {
    dir: PathBuf,
    rx: Receiver<Signal>,
    source: Box<dyn ChangeSource>,
    _registration: Registration,
}

impl Session {
    fn next(&self, until: Option<Instant>) -> Result<Wake, QueueError> {
        let now = Instant::now();
        if until.is_some_and(|u| now >= u) {
            return Ok(Wake::Deadline);
        }
        let limit = [until.map(|u| u - now), self.source.tick()]
            .into_iter()
            .flatten()
            .min();
        let received = match limit {
            Some(limit) => self.rx.recv_timeout(limit),
            None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Signal::Cancel) => Ok(Wake::Cancelled),
            Ok(Signal::Fs(Ok(event))) if is_arrival(&event) => Ok(Wake::Arrival),
            Ok(Signal::Fs(Ok(_))) => Ok(Wake::Ignored),
            Ok(Signal::Fs(Err(source))) => Err(QueueError::Notify {
                path: self.dir.clone(),
                source,
            }),
            Err(RecvTimeoutError::Timeout) if until.is_some_and(|u| Instant::now() >= u) => {
                Ok(Wake::Deadline)
            }
            Err(RecvTimeoutError::Timeout) => Ok(Wake::Tick),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::WatchClosed),
        }
    }
}

impl MailQueue {
    /// Watcher on `agent`'s `inbox/new`, configured from this queue.
    ///
    /// Creates the directory if needed and validates against the known-agent
    /// list in `<root>/meta/config.json` when present.
    pub fn watcher(&self, agent: &str) -> Result<Watcher, QueueError> {
        validate_handle(agent)?;
        let dir = self.layout().inbox_new(agent);
        std::fs::create_dir_all(&dir).map_err(at(&dir))?;
        Ok(Watcher::new(dir, WatchOptions::from(&self.config().watch))
            .with_validator(BasicValidator::from_root(self.root())))
    }
}
