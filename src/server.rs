//! HTTP surface: dashboard page, login, and the WebSocket stream.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Router};
use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use tokio::net::TcpListener;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::{HighlightRule, Profiles, Source};
use crate::error::Error;
use crate::gate::{self, SessionGate};
use crate::hub::Hub;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const INDEX_TEMPLATE: &str = "index.html";
const LOGIN_TEMPLATE: &str = "login.html";

/// What the dashboard page needs to know about one source.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DashboardEntry {
    pub index: usize,
    pub name: String,
    pub rules: Vec<HighlightRule>,
}

pub fn dashboard_entries(sources: &[Source], profiles: &Profiles) -> Vec<DashboardEntry> {
    sources
        .iter()
        .map(|source| DashboardEntry {
            index: source.index,
            name: source.name.clone(),
            rules: profiles.rules(&source.profile).to_vec(),
        })
        .collect()
}

/// The embedded page templates.
#[derive(Debug)]
pub struct Pages {
    tera: Tera,
}

impl Pages {
    pub fn new() -> Result<Self, Error> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (INDEX_TEMPLATE, include_str!("../templates/index.html")),
            (LOGIN_TEMPLATE, include_str!("../templates/login.html")),
        ])?;
        Ok(Pages { tera })
    }

    pub fn index(&self, entries: &[DashboardEntry]) -> Result<String, Error> {
        // Keep a stray "</script>" inside rule text from closing the tag.
        let json = serde_json::to_string(entries)
            .map_err(io::Error::from)?
            .replace("</", "<\\/");

        let mut context = Context::new();
        context.insert("dashboard_json", &json);
        Ok(self.tera.render(INDEX_TEMPLATE, &context)?)
    }

    pub fn login(&self, failed: bool) -> Result<String, Error> {
        let mut context = Context::new();
        context.insert("error", &failed);
        Ok(self.tera.render(LOGIN_TEMPLATE, &context)?)
    }
}

/// Shared by every request handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub hub: Hub,
    pub gate: SessionGate,
    pub dashboard: Arc<Vec<DashboardEntry>>,
    pub pages: Arc<Pages>,
    /// How long one frame may take to reach a client before it is dropped.
    pub write_timeout: Duration,
}

impl AppState {
    pub fn new(hub: Hub, gate: SessionGate, dashboard: Vec<DashboardEntry>) -> Result<Self, Error> {
        Ok(AppState {
            hub,
            gate,
            dashboard: Arc::new(dashboard),
            pages: Arc::new(Pages::new()?),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

pub fn router(state: AppState) -> Router {
    let pages = Router::new().route("/", get(index)).route_layer(
        middleware::from_fn_with_state(state.clone(), gate::require_page_session),
    );
    let stream = Router::new().route("/ws", get(stream)).route_layer(
        middleware::from_fn_with_state(state.clone(), gate::require_stream_session),
    );

    Router::new()
        .merge(pages)
        .merge(stream)
        .route("/login", get(login_form).post(login_submit))
        .with_state(state)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Error> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn render(page: Result<String, Error>) -> Response {
    match page {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!(error = %e, "failed to render page");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render page").into_response()
        }
    }
}

async fn index(State(state): State<AppState>) -> Response {
    render(state.pages.index(&state.dashboard))
}

async fn login_form(State(state): State<AppState>) -> Response {
    if state.gate.is_open() {
        return gate::redirect("/");
    }
    render(state.pages.login(false))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginForm {
    password: String,
}

async fn login_submit(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    if state.gate.is_open() {
        return gate::redirect("/");
    }

    match state.gate.login(&form.password) {
        Some(cookie) => {
            info!("login succeeded");
            gate::with_cookie(gate::redirect("/"), cookie)
        }
        None => {
            warn!("login failed");
            render(state.pages.login(true))
        }
    }
}

async fn stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.hub.clone();
    let write_timeout = state.write_timeout;
    ws.on_upgrade(move |socket| serve_client(socket, hub, write_timeout))
}

/// Runs one client connection: replay, live lines, and disconnect detection.
///
/// Registration queues the history before the client joins the live set, so
/// the client sees it before anything ingested afterwards. Anything the
/// client sends is read only to notice that it went away.
pub async fn serve_client(socket: WebSocket, hub: Hub, write_timeout: Duration) {
    let subscription = hub.register();
    let id = subscription.id();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    debug!(client = id, "dropped by hub");
                    break;
                };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(client = id, error = %e, "failed to encode line");
                        continue;
                    }
                };
                match time::timeout(write_timeout, sender.send(Message::Text(payload.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(client = id, error = %e, "send failed");
                        break;
                    }
                    Err(_) => {
                        debug!(client = id, "write deadline exceeded");
                        break;
                    }
                }
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(client = id, error = %e, "read failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    subscription.unregister();
    // A stalled peer would block the close frame just like any other.
    let _ = time::timeout(write_timeout, sender.close()).await;
}
