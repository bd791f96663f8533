//! Everything related to reading lines from a followed file.

use std::collections::VecDeque;
use std::fmt;
use std::fs::Metadata;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task;
use std::time::Duration;

use futures_util::ready;
use futures_util::stream::Stream as FuturesStream;
use pin_project_lite::pin_project;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::Error;
use crate::events::FileEvents;

/// An infinite, non-restartable sequence of lines from one source.
///
/// Implementations recover from rotation on their own; an `Err` item is a
/// transient failure and the stream keeps going after it.
pub trait LineSource: FuturesStream<Item = io::Result<String>> + Send + Unpin + 'static {}

impl<T> LineSource for T where T: FuturesStream<Item = io::Result<String>> + Send + Unpin + 'static {}

/// How a [`Tail`] learns that its file may have changed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatchMode {
    /// Stat and read the file on a fixed interval.
    Poll { interval: Duration },
    /// Wake on filesystem notifications, still checking every `fallback` in
    /// case an event is missed.
    Native { fallback: Duration },
}

impl Default for WatchMode {
    fn default() -> Self {
        WatchMode::Poll {
            interval: Duration::from_millis(250),
        }
    }
}

enum Trigger {
    Poll(Interval),
    Native(FileEvents, Duration),
}

impl Trigger {
    fn new(mode: WatchMode, path: &Path) -> Self {
        match mode {
            WatchMode::Poll { interval } => Trigger::poll(interval),
            WatchMode::Native { fallback } => match FileEvents::new(path) {
                Ok(events) => Trigger::Native(events, fallback),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "file notifications unavailable, polling instead");
                    Trigger::poll(fallback)
                }
            },
        }
    }

    fn poll(interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let mut interval = time::interval_at(time::Instant::now() + interval, interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Trigger::Poll(interval)
    }

    async fn wait(&mut self) {
        match self {
            Trigger::Poll(interval) => {
                interval.tick().await;
            }
            Trigger::Native(events, fallback) => {
                tokio::select! {
                    event = events.next_event() => match event {
                        Some(Ok(_)) => events.drain(),
                        Some(Err(e)) => debug!(error = %e, "watch error"),
                        None => time::sleep(*fallback).await,
                    },
                    _ = time::sleep(*fallback) => {}
                }
            }
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            Trigger::Poll(interval) => write!(f, "Poll({:?})", interval.period()),
            Trigger::Native(events, fallback) => write!(f, "Native({:?}, {:?})", events, fallback),
        }
    }
}

/// Identifies the file behind a path, so a replaced file can be told apart
/// from the one already open.
#[cfg(unix)]
fn identity(meta: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;

    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn identity(_meta: &Metadata) -> Option<(u64, u64)> {
    None
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    identity: Option<(u64, u64)>,
    /// Bytes consumed from the current file.
    pos: u64,
    /// Bytes of a line whose newline has not been written yet.
    partial: Vec<u8>,
    /// Read once before waiting on the trigger.
    primed: bool,
    trigger: Trigger,
}

impl Inner {
    async fn open(path: PathBuf, mode: WatchMode) -> io::Result<Self> {
        let file = File::open(&path).await?;
        let identity = identity(&file.metadata().await?);
        let trigger = Trigger::new(mode, &path);

        Ok(Inner {
            path,
            reader: Some(BufReader::new(file)),
            identity,
            pos: 0,
            partial: Vec::new(),
            primed: true,
            trigger,
        })
    }

    fn reset(&mut self, reader: Option<BufReader<File>>, identity: Option<(u64, u64)>) {
        self.reader = reader;
        self.identity = identity;
        self.pos = 0;
        self.partial.clear();
    }

    /// Reads every complete line up to the current end of file.
    async fn read_lines(&mut self, mut emit: impl FnMut(String) + Send) -> io::Result<()> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };

        loop {
            let n = reader.read_until(b'\n', &mut self.partial).await?;
            if n == 0 {
                return Ok(());
            }
            self.pos += n as u64;

            if self.partial.last() == Some(&b'\n') {
                emit(decode_line(&self.partial));
                self.partial.clear();
            }
        }
    }

    async fn read_available(&mut self) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();

        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Removed; whatever the old handle still has is the last of it.
                if self.reader.is_some() {
                    self.read_lines(|line| lines.push(line)).await?;
                    debug!(path = %self.path.display(), "file removed, waiting for it to reappear");
                    self.reset(None, None);
                }
                return Ok(lines);
            }
            Err(e) => return Err(e),
        };

        let current = identity(&meta);
        let replaced = self.reader.is_some() && current.is_some() && current != self.identity;

        if replaced {
            self.read_lines(|line| lines.push(line)).await?;
            debug!(path = %self.path.display(), "file replaced, reopening");
        }

        if self.reader.is_none() || replaced {
            let file = File::open(&self.path).await?;
            self.reset(Some(BufReader::new(file)), current);
        } else if meta.len() < self.pos {
            debug!(path = %self.path.display(), size = meta.len(), pos = self.pos, "file truncated, rewinding");
            if let Some(reader) = self.reader.as_mut() {
                reader.seek(io::SeekFrom::Start(0)).await?;
            }
            self.pos = 0;
            self.partial.clear();
        }

        self.read_lines(|line| lines.push(line)).await?;

        Ok(lines)
    }
}

async fn step(mut inner: Inner) -> (Inner, io::Result<Vec<String>>) {
    if inner.primed {
        inner.primed = false;
    } else {
        inner.trigger.wait().await;
    }

    let res = inner.read_available().await;

    (inner, res)
}

type StepFuture = Pin<Box<dyn Future<Output = (Inner, io::Result<Vec<String>>)> + Send>>;

pin_project! {
/// Follows one file like `tail -F`, yielding each line appended to it.
///
/// ## Streaming lines
///
/// `Tail` implements [`futures::Stream`] which internally:
///   1. Waits on its trigger (poll interval or filesystem notification).
///   2. Checks whether the file was removed, replaced or truncated, and
///      reopens or rewinds as needed.
///   3. Reads every complete line up to end of file.
///   4. Returns `Poll::Ready` for each buffered line in order.
///
/// Read failures are yielded as `Err` items and retried on the next wakeup;
/// the stream itself never ends.
///
/// [`futures::Stream`]: https://docs.rs/futures/0.3/futures/stream/trait.Stream.html
pub struct Tail {
    inner: Option<Inner>,
    pending: VecDeque<String>,
    step: Option<StepFuture>,
}
}

impl fmt::Debug for Tail {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Tail")
            .field("inner", &self.inner)
            .field("pending", &self.pending)
            .field("step", &self.step.as_ref().map(|_| "<elided>"))
            .finish()
    }
}

impl Tail {
    fn from_inner(inner: Inner) -> Self {
        Tail {
            inner: Some(inner),
            pending: VecDeque::new(),
            step: None,
        }
    }

    /// Opens `path` and follows it from its current end.
    pub async fn open(path: impl Into<PathBuf>, mode: WatchMode) -> Result<Self, Error> {
        let mut inner = Inner::open(path.into(), mode).await?;

        if let Some(reader) = inner.reader.as_mut() {
            inner.pos = reader.seek(io::SeekFrom::End(0)).await?;
        }

        Ok(Tail::from_inner(inner))
    }

    /// Opens `path`, returns up to its last `backlog` complete lines, and
    /// follows it from exactly where that scan stopped.
    ///
    /// A trailing line without its newline is not part of the backlog; it is
    /// yielded by the stream once completed.
    pub async fn with_backlog(
        path: impl Into<PathBuf>,
        backlog: usize,
        mode: WatchMode,
    ) -> Result<(Vec<String>, Self), Error> {
        let mut inner = Inner::open(path.into(), mode).await?;

        let mut window = VecDeque::with_capacity(backlog);
        inner
            .read_lines(|line| {
                if backlog == 0 {
                    return;
                }
                if window.len() == backlog {
                    window.pop_front();
                }
                window.push_back(line);
            })
            .await?;

        Ok((window.into(), Tail::from_inner(inner)))
    }

    /// Returns the path being followed.
    pub fn path(&self) -> Option<&Path> {
        self.inner.as_ref().map(|inner| inner.path.as_path())
    }
}

impl FuturesStream for Tail {
    type Item = io::Result<String>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let this = self.project();

        loop {
            if let Some(line) = this.pending.pop_front() {
                return task::Poll::Ready(Some(Ok(line)));
            }

            if this.step.is_none() {
                // Temporarily take the reader state so that it can be
                // modified within the async step.
                let Some(inner) = this.inner.take() else {
                    return task::Poll::Ready(None);
                };
                *this.step = Some(Box::pin(step(inner)));
            }
            let Some(fut) = this.step.as_mut() else {
                return task::Poll::Ready(None);
            };

            let (inner, res) = ready!(fut.as_mut().poll(cx));
            *this.step = None;
            *this.inner = Some(inner);

            match res {
                Ok(lines) => this.pending.extend(lines),
                Err(e) => return task::Poll::Ready(Some(Err(e))),
            }
        }
    }
}
