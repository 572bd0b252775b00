use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use tracing::info;

use crate::bridge::BridgeCore;
use crate::bridge::activity::ActivityHandler;
use crate::bridge::hooks::LocalHooks;
use crate::cache::AsyncTimedCache;

mod avatar;
mod health;
mod hooks;
mod metrics;
mod webhook;

use self::avatar::get_avatar;
use self::health::{get_status, health_check};
use self::hooks::process_hook;
use self::metrics::metrics_endpoint;
use self::webhook::process_activity;

const AVATAR_TTL: Duration = Duration::from_secs(5 * 60);

pub struct WebState {
    pub core: BridgeCore,
    pub activities: Arc<ActivityHandler>,
    pub hooks: Arc<LocalHooks>,
    pub avatars: AsyncTimedCache<String, Vec<u8>>,
    pub started_at: Instant,
}

impl WebState {
    pub fn new(core: BridgeCore, activities: Arc<ActivityHandler>, hooks: Arc<LocalHooks>) -> Self {
        Self {
            core,
            activities,
            hooks,
            avatars: AsyncTimedCache::new(AVATAR_TTL),
            started_at: Instant::now(),
        }
    }
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

pub struct WebServer {
    bind_addr: String,
}

impl WebServer {
    pub fn new(state: WebState) -> Self {
        let server = &state.core.config().server;
        let bind_addr = format!("{}:{}", server.bind_address, server.port);
        let _ = WEB_STATE.set(state);
        Self { bind_addr }
    }

    pub async fn start(&self) -> Result<()> {
        info!("starting web server on {}", self.bind_addr);
        let acceptor = TcpListener::new(self.bind_addr.clone()).bind().await;
        Server::new(acceptor).serve(root_router()).await;
        Ok(())
    }
}

pub fn root_router() -> Router {
    Router::new()
        .post(process_activity)
        .push(Router::with_path("lifecycle").post(process_activity))
        .push(Router::with_path("avatar/{userId}").get(get_avatar))
        .push(Router::with_path("hooks/{event}").post(process_hook))
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("status").get(get_status))
        .push(Router::with_path("metrics").get(metrics_endpoint))
}
