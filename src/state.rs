//! # Application State Management
//!
//! State shared by every HTTP request handler.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every handler gets a clone of `AppState`; the clones point at the same data
//!
//! ### tokio::sync::RwLock
//! - Many handlers may read the configuration at once, one may update it
//! - Unlike `std::sync::RwLock` it can be held across `.await` and cannot be poisoned
//!
//! ### The session controller
//! - Owns the one voice session; it does its own locking internally, so it is shared
//!   through a plain `Arc`

use crate::config::AppConfig;
use crate::session::SessionController;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct AppState {
    /// Configuration as served by the config endpoints
    pub config: Arc<RwLock<AppConfig>>,

    pub controller: Arc<SessionController>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, controller: Arc<SessionController>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            controller,
            start_time: Instant::now(),
        }
    }

    pub async fn get_config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// Replace the configuration. The running session keeps its settings; the next
    /// one started picks these up.
    pub async fn update_config(&self, config: AppConfig) {
        *self.config.write().await = config.clone();
        self.controller.update_config(config).await;
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
