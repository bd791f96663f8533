//! Streams the tail of growing log files to browsers in near real time.
//!
//! Each configured file is followed by its own task (a [`Tail`] driven either
//! by polling or by [`notify`](https://crates.io/crates/notify) events). Lines
//! flow through one channel into the [`Hub`], which keeps a bounded history
//! per source and fans every line out to the connected WebSocket clients.
//! A client that connects late first receives that history, then live lines.
//!
//! ## Example
//!
//! ```no_run
//! use tailhub::{follower, server, AppState, Hub, HubConfig, SessionGate, WatchMode};
//! use tailhub::config::{DashboardConfig, Profiles};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tailhub::Error> {
//!     let config = DashboardConfig::load("dashboard.json");
//!     let sources = config.sources();
//!     let profiles = Profiles::load("configs", &sources);
//!
//!     let hub = Hub::new(HubConfig {
//!         sources: sources.len(),
//!         ..HubConfig::default()
//!     });
//!     let (tx, rx) = mpsc::channel(follower::INGEST_QUEUE);
//!     follower::spawn_followers(&sources, &hub, &tx, WatchMode::default()).await;
//!     tokio::spawn({
//!         let hub = hub.clone();
//!         async move { hub.run(rx).await }
//!     });
//!
//!     let state = AppState::new(
//!         hub,
//!         SessionGate::new(config.password()),
//!         server::dashboard_entries(&sources, &profiles),
//!     )?;
//!     let listener = server::bind(([0, 0, 0, 0], 9000).into()).await?;
//!     server::serve(listener, state, std::future::pending()).await
//! }
//! ```
//!
//! ## Caveats
//!
//! A followed file's parent directory must exist when notification-based
//! watching is selected; otherwise that follower falls back to polling.

pub mod config;
mod error;
mod events;
pub mod follower;
pub mod gate;
pub mod hub;
mod reader;
pub mod server;

pub use error::{Error, Result};
pub use events::FileEvents;
pub use gate::SessionGate;
pub use hub::{ClientId, Hub, HubConfig, LineEvent, OverflowPolicy, Subscription};
pub use reader::{LineSource, Tail, WatchMode};
pub use server::AppState;
