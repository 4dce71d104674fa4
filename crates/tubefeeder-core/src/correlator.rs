//! Response correlation
//!
//! The firmware tags nothing, so a reply belongs to a command only by timing.
//! A reader task drains the port into an ordered queue for the lifetime of a
//! connection; a command drains stale lines, writes, then collects whatever
//! arrives until the line goes quiet or its window closes.
//!
//! Known limitation: unsolicited lines the controller prints between
//! commands are attributed to the next command that collects.

use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::error::{FeederError, Result};
use crate::transport::InboundLink;

/// A command waiting for its reply
#[derive(Debug)]
pub struct PendingCommand {
    command: String,
    issued_at: Instant,
    timeout: Duration,
    lines: Vec<String>,
}

impl PendingCommand {
    /// Start the response window now
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            issued_at: Instant::now(),
            timeout,
            lines: Vec::new(),
        }
    }

    /// Wire text that was written
    pub fn command(&self) -> &str {
        &self.command
    }

    /// When collection gives up if nothing has arrived
    pub fn deadline(&self) -> Instant {
        self.issued_at + self.timeout
    }

    /// Lines collected so far
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Owns the reader task and the inbound line queue of the current connection
pub struct ResponseCorrelator {
    inbound: Mutex<Option<UnboundedReceiver<String>>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    quiet_interval: Duration,
}

impl ResponseCorrelator {
    /// Create a detached correlator
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            inbound: Mutex::new(None),
            reader: std::sync::Mutex::new(None),
            quiet_interval,
        }
    }

    /// Silence after a line that ends a reply
    pub fn quiet_interval(&self) -> Duration {
        self.quiet_interval
    }

    /// Start reading a freshly opened connection, replacing any previous queue
    pub async fn attach(&self, link: InboundLink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(read_lines(link, tx));
        *self.inbound.lock().await = Some(rx);
        let previous = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Wait for the reader of a closed connection to finish and drop its queue
    pub async fn detach(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if time::timeout(Duration::from_secs(1), handle).await.is_err() {
                debug!("reader task did not stop within 1s");
            }
        }
        self.inbound.lock().await.take();
    }

    /// Stop the reader without waiting (for `Drop`)
    pub fn abort(&self) {
        if let Some(handle) = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Take exclusive use of the inbound queue for one exchange
    ///
    /// Holding the guard is what makes the queue single-consumer: a second
    /// exchange waits here until the first one has collected its reply.
    pub async fn acquire(&self) -> Result<Inbound<'_>> {
        let guard = self.inbound.lock().await;
        if guard.is_none() {
            return Err(FeederError::NotConnected);
        }
        Ok(Inbound {
            guard,
            quiet_interval: self.quiet_interval,
        })
    }
}

/// Exclusive access to the inbound queue
pub struct Inbound<'a> {
    guard: MutexGuard<'a, Option<UnboundedReceiver<String>>>,
    quiet_interval: Duration,
}

impl Inbound<'_> {
    /// Discard lines that arrived before the next command is written
    pub fn drain(&mut self) -> usize {
        let Some(rx) = self.guard.as_mut() else {
            return 0;
        };
        let mut stale = 0;
        while let Ok(line) = rx.try_recv() {
            debug!("discarding stale line: {}", line);
            stale += 1;
        }
        stale
    }

    /// Collect the reply to `pending`
    ///
    /// Returns after the full timeout when nothing arrives, after the quiet
    /// interval once at least one line has arrived, or immediately when the
    /// connection closes. An empty result is not an error here.
    pub async fn collect(&mut self, mut pending: PendingCommand) -> Vec<String> {
        let Some(rx) = self.guard.as_mut() else {
            return pending.into_lines();
        };

        loop {
            let now = Instant::now();
            let deadline = pending.deadline();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            let wait = if pending.lines.is_empty() {
                remaining
            } else {
                self.quiet_interval.min(remaining)
            };

            match time::timeout(wait, rx.recv()).await {
                Ok(Some(line)) => pending.lines.push(line),
                Ok(None) => {
                    debug!("connection closed while collecting reply to '{}'", pending.command);
                    break;
                }
                Err(_) => break,
            }
        }

        debug!(
            "'{}': {} line(s) in {}ms",
            pending.command,
            pending.lines.len(),
            pending.issued_at.elapsed().as_millis()
        );
        pending.into_lines()
    }
}

/// Reader task: forward every non-empty line until the connection ends
async fn read_lines(mut link: InboundLink, tx: UnboundedSender<String>) {
    let reason = loop {
        tokio::select! {
            biased;
            _ = link.shutdown.cancelled() => break "connection closed",
            next = link.lines.next() => match next {
                Some(Ok(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    trace!("<< {}", line);
                    if tx.send(line).is_err() {
                        break "line queue dropped";
                    }
                }
                Some(Err(e)) => {
                    link.state.mark_lost(&format!("read failed: {}", e)).await;
                    break "read error";
                }
                None => {
                    link.state.mark_lost("controller closed the port").await;
                    break "end of stream";
                }
            },
        }
    };
    debug!("reader exiting: {}", reason);
}
