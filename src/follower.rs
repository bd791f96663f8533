//! One task per configured file, feeding the hub.

use futures_util::future;
use futures_util::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Source;
use crate::hub::{Hub, LineEvent};
use crate::reader::{LineSource, Tail, WatchMode};

/// Capacity of the channel between followers and the hub.
pub const INGEST_QUEUE: usize = 1024;

/// Forwards every line of `lines` to the hub as coming from `source_index`.
///
/// Read errors are transient by contract and only logged. Returns when the
/// hub side of the channel has gone away.
pub async fn follow<S: LineSource>(source_index: usize, mut lines: S, tx: mpsc::Sender<LineEvent>) {
    while let Some(line) = lines.next().await {
        match line {
            Ok(text) => {
                if tx.send(LineEvent::new(source_index, text)).await.is_err() {
                    debug!(source_index, "hub gone, follower stopping");
                    return;
                }
            }
            Err(e) => debug!(source_index, error = %e, "read failed, will retry"),
        }
    }
}

/// Opens `source`'s file and seeds the hub with the end of it.
///
/// Returns `None` for a source without a path or whose file can't be
/// opened; that disables this source only.
pub async fn open_source(source: &Source, hub: &Hub, mode: WatchMode) -> Option<Tail> {
    let Some(path) = source.path.as_deref() else {
        info!(source = %source.name, "no path configured, skipping");
        return None;
    };

    let (backlog, tail) = match Tail::with_backlog(path, hub.config().history_len, mode).await {
        Ok(opened) => opened,
        Err(e) => {
            error!(source = %source.name, path = %path.display(), error = %e, "cannot open log, source disabled");
            return None;
        }
    };

    info!(source = %source.name, path = %path.display(), backlog = backlog.len(), "following");
    hub.seed(source.index, backlog);
    Some(tail)
}

/// Opens and seeds every source, then spawns a follower for each one that
/// opened.
///
/// History is complete for every source by the time this returns, so
/// serving should start only afterwards.
pub async fn spawn_followers(
    sources: &[Source],
    hub: &Hub,
    tx: &mpsc::Sender<LineEvent>,
    mode: WatchMode,
) -> Vec<JoinHandle<()>> {
    let opened = future::join_all(sources.iter().map(|source| async move {
        open_source(source, hub, mode)
            .await
            .map(|tail| (source.index, tail))
    }))
    .await;

    opened
        .into_iter()
        .flatten()
        .map(|(index, tail)| tokio::spawn(follow(index, tail, tx.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use futures_util::stream;
    use std::io;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_follow_skips_errors() {
        let lines = stream::iter(vec![
            Ok("one".to_string()),
            Err(io::Error::new(io::ErrorKind::Other, "flaky disk")),
            Ok("two".to_string()),
        ]);
        let (tx, mut rx) = mpsc::channel(8);

        follow(3, lines, tx).await;

        assert_eq!(rx.recv().await, Some(LineEvent::new(3, "one")));
        assert_eq!(rx.recv().await, Some(LineEvent::new(3, "two")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_missing_file_disables_only_that_source() {
        let tmp_dir = tempdir().unwrap();
        let good = tmp_dir.path().join("good.log");
        std::fs::write(&good, "hello\n").unwrap();

        let sources = vec![
            Source {
                index: 0,
                path: Some(tmp_dir.path().join("missing.log")),
                name: "missing".to_string(),
                profile: "default".to_string(),
            },
            Source {
                index: 1,
                path: None,
                name: "pathless".to_string(),
                profile: "default".to_string(),
            },
            Source {
                index: 2,
                path: Some(PathBuf::from(&good)),
                name: "good".to_string(),
                profile: "default".to_string(),
            },
        ];
        let hub = Hub::new(HubConfig {
            sources: sources.len(),
            ..HubConfig::default()
        });
        let (tx, _rx) = mpsc::channel(INGEST_QUEUE);

        let handles = spawn_followers(&sources, &hub, &tx, WatchMode::default()).await;

        assert_eq!(handles.len(), 1);
        assert_eq!(hub.history(2), vec!["hello"]);
        assert!(hub.history(0).is_empty());
    }

    #[tokio::test]
    async fn test_history_seeded_before_followers_start() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("big.log");
        let content: String = (1..=500).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, content).unwrap();

        let sources = vec![Source {
            index: 0,
            path: Some(path),
            name: "big".to_string(),
            profile: "default".to_string(),
        }];
        let hub = Hub::new(HubConfig {
            sources: 1,
            ..HubConfig::default()
        });
        let (tx, _rx) = mpsc::channel(INGEST_QUEUE);

        spawn_followers(&sources, &hub, &tx, WatchMode::default()).await;

        // A client joining right away gets the whole backlog.
        let sub = hub.register();
        assert_eq!(sub.queued(), 50);
        let first = timeout(Duration::from_secs(1), sub.recv()).await.unwrap();
        assert_eq!(first, Some(LineEvent::new(0, "line 451")));
    }
}
