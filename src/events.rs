//! Filesystem notifications for a single followed file.
//!
//! The parent directory is watched rather than the file itself, so that a
//! file which is removed and recreated (log rotation) keeps producing events
//! without having to re-register the watch.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::Error;

/// Stream of filesystem events that concern one file path.
///
/// Internally, `FileEvents` owns a [`notify::RecommendedWatcher`] whose
/// callback proxies into a tokio channel, adding async/await support.
pub struct FileEvents {
    _inner: notify::RecommendedWatcher,
    path: PathBuf,
    directory: PathBuf,
    event_stream: mpsc::UnboundedReceiver<Result<notify::Event, notify::Error>>,
}

impl Debug for FileEvents {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("FileEvents")
            .field("path", &self.path)
            .field("directory", &self.directory)
            .finish()
    }
}

impl FileEvents {
    /// Starts watching `path`, which need not exist yet. Its parent
    /// directory must exist.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = absolutify(path)?;

        if path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", path.display()),
            )
            .into());
        }
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "File needs a parent directory"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // The receiver only goes away together with the watcher.
            let _ = tx.send(res);
        })?;
        inner.watch(&directory, RecursiveMode::NonRecursive)?;

        Ok(FileEvents {
            _inner: inner,
            path,
            directory,
            event_stream: rx,
        })
    }

    /// The absolute path being watched.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn concerns(&self, event: &notify::Event) -> bool {
        // Rescans and overflow notices carry no paths; treat them as relevant.
        event.paths.is_empty() || event.paths.iter().any(|p| p == &self.path)
    }

    /// Waits for the next event touching the watched file.
    ///
    /// Returns `None` once the underlying watcher has shut down.
    pub async fn next_event(&mut self) -> Option<Result<notify::Event, Error>> {
        loop {
            match self.event_stream.recv().await? {
                Ok(event) if self.concerns(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    /// Discards queued events, so that a burst of writes results in a single
    /// wakeup.
    pub fn drain(&mut self) {
        while self.event_stream.try_recv().is_ok() {}
    }
}

fn absolutify(path: impl Into<PathBuf>) -> io::Result<PathBuf> {
    let path = path.into();

    let parent = match path.parent() {
        Some(dir) if dir != Path::new("") => dir.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let filename = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?
        .to_os_string();

    let parent = parent.canonicalize().unwrap_or(parent);

    Ok(parent.join(filename))
}

#[cfg(test)]
mod tests {
    use super::{absolutify, FileEvents};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    #[test]
    fn test_watch_directory() {
        let tmp_dir = tempdir().unwrap();

        assert!(FileEvents::new(tmp_dir.path()).is_err());
    }

    #[test]
    fn test_watch_bad_filename() {
        let tmp_dir = tempdir().unwrap();

        // This is not okay
        assert!(FileEvents::new(tmp_dir.path().join("..")).is_err());
    }

    #[test]
    fn test_absolutify_relative() {
        let abs = absolutify("some.log").unwrap();
        assert!(abs.is_absolute());
        assert_eq!(abs.file_name().unwrap(), "some.log");
    }

    #[tokio::test]
    async fn test_missing_file_then_created() {
        let tmp_dir = tempdir().unwrap();
        let file_path = tmp_dir.path().join("later.log");

        let mut events = FileEvents::new(&file_path).unwrap();
        assert!(events.path().ends_with("later.log"));

        // Noise from a sibling file must be filtered out.
        tokio::fs::write(tmp_dir.path().join("other.log"), b"x\n")
            .await
            .unwrap();
        tokio::fs::write(&file_path, b"hello\n").await.unwrap();

        let event = timeout(Duration::from_secs(2), events.next_event())
            .await
            .expect("no event for created file")
            .unwrap()
            .unwrap();
        assert!(event.paths.is_empty() || event.paths.iter().any(|p| p.ends_with("later.log")));
    }
}
