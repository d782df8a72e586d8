//! Live capture entry point: picks push or pull and runs it.
//!
//! Push (the event socket) is used whenever an app-level token is
//! configured; it is near-realtime and cheap. Without one, the poller is the
//! fallback. Exactly one path runs at a time — both write through the same
//! idempotent store, but running both would just double the request spend.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::api::ChatApi;
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::listener::EventListener;
use crate::notify::Notifier;
use crate::poller::Poller;
use crate::stop::StopFlag;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Push,
    Pull,
}

impl CaptureMode {
    /// Push when an app-level token is present, pull otherwise.
    pub fn select(config: &Config) -> Self {
        match &config.source.app_token {
            Some(token) if !token.is_empty() => CaptureMode::Push,
            _ => CaptureMode::Pull,
        }
    }
}

/// Run live capture until the stop flag is raised or a fatal error occurs.
pub async fn run(
    api: Arc<dyn ChatApi>,
    store: Store,
    limiter: Arc<RateLimiter>,
    notifier: Notifier,
    config: &Config,
    stop: StopFlag,
) -> Result<()> {
    match CaptureMode::select(config) {
        CaptureMode::Push => {
            info!("live capture: push (event socket)");
            let mut listener = EventListener::new(api, store, limiter, notifier, stop);
            listener.run().await
        }
        CaptureMode::Pull => {
            info!("live capture: pull (poller)");
            let poller = Poller::new(
                api,
                store,
                limiter,
                notifier,
                config.limits.clone(),
                stop,
            );
            poller.run().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(app_token: Option<&str>) -> Config {
        let mut toml_src = String::from(
            r#"
            [db]
            path = "/tmp/chx.sqlite"

            [source]
            token = "xoxb-test"

            [server]
            bind = "127.0.0.1:7341"
            "#,
        );
        if let Some(token) = app_token {
            toml_src = toml_src.replace(
                "token = \"xoxb-test\"",
                &format!("token = \"xoxb-test\"\napp_token = \"{}\"", token),
            );
        }
        toml::from_str(&toml_src).unwrap()
    }

    #[test]
    fn test_push_selected_with_app_token() {
        assert_eq!(CaptureMode::select(&config(Some("xapp-1"))), CaptureMode::Push);
    }

    #[test]
    fn test_pull_selected_without_app_token() {
        assert_eq!(CaptureMode::select(&config(None)), CaptureMode::Pull);
        assert_eq!(CaptureMode::select(&config(Some(""))), CaptureMode::Pull);
    }
}
