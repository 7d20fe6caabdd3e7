//! Wi-Fi hotspot state machine
//!
//! The access point is a NetworkManager connection switched with `nmcli`.
//! A toggle moves the state to `Starting`/`Stopping`, runs the command and
//! polls NetworkManager until the connection reaches the wanted state. If
//! the command fails or the poll runs out of time, the state reverts to
//! the last confirmed value. Toggles during a transition are rejected.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::system::{ExternalCommandError, SystemCommands};
use crate::config::HotspotConfig;
use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HotspotState {
    Off,
    Starting,
    On,
    Stopping,
}

impl HotspotState {
    pub fn is_transitional(self) -> bool {
        matches!(self, HotspotState::Starting | HotspotState::Stopping)
    }
}

impl fmt::Display for HotspotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HotspotState::Off => "off",
            HotspotState::Starting => "starting",
            HotspotState::On => "on",
            HotspotState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct Inner {
    runner: Arc<dyn SystemCommands>,
    config: HotspotConfig,
    state: watch::Sender<HotspotState>,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct HotspotManager {
    inner: Arc<Inner>,
}

/// `nmcli -t -f ACTIVE,NAME con show` output: is `name` active?
pub fn connection_active(output: &str, name: &str) -> bool {
    output.lines().any(|line| {
        line.trim()
            .split_once(':')
            .is_some_and(|(active, conn)| active == "yes" && conn.replace("\\:", ":") == name)
    })
}

impl HotspotManager {
    pub fn new(runner: Arc<dyn SystemCommands>, config: HotspotConfig) -> Self {
        let (state, _) = watch::channel(HotspotState::Off);
        Self {
            inner: Arc::new(Inner {
                runner,
                config,
                state,
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> HotspotState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HotspotState> {
        self.inner.state.subscribe()
    }

    /// Reason the most recent toggle failed, cleared by a successful one
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Pick up the real connection state, e.g. at startup
    pub async fn refresh(&self) -> Result<HotspotState, ControlError> {
        let active = self
            .query_active()
            .await
            .map_err(|e| e.into_control(&self.status_argv()))?;
        let observed = if active { HotspotState::On } else { HotspotState::Off };

        self.inner.state.send_if_modified(|state| {
            if state.is_transitional() || *state == observed {
                return false;
            }
            *state = observed;
            true
        });
        Ok(self.state())
    }

    /// Begin switching the hotspot. Returns the transitional state; the
    /// outcome arrives later through [`subscribe`](Self::subscribe).
    pub fn toggle(&self) -> Result<HotspotState, ControlError> {
        let mut started = None;
        self.inner.state.send_if_modified(|state| {
            let next = match *state {
                HotspotState::Off => HotspotState::Starting,
                HotspotState::On => HotspotState::Stopping,
                HotspotState::Starting | HotspotState::Stopping => return false,
            };
            started = Some((*state, next));
            *state = next;
            true
        });

        let Some((previous, transitional)) = started else {
            debug!(state = %self.state(), "Hotspot toggle rejected, transition in flight");
            return Err(ControlError::Busy);
        };

        info!(from = %previous, to = %transitional, "Hotspot toggle started");
        let manager = self.clone();
        tokio::spawn(async move { manager.drive(previous, transitional).await });
        Ok(transitional)
    }

    async fn drive(self, previous: HotspotState, transitional: HotspotState) {
        let want_active = transitional == HotspotState::Starting;
        let limit = self.inner.config.toggle_timeout();

        let outcome = timeout(limit, self.switch(want_active)).await;
        let (final_state, error) = match outcome {
            Ok(Ok(())) => (
                if want_active { HotspotState::On } else { HotspotState::Off },
                None,
            ),
            Ok(Err(e)) => (previous, Some(e.to_string())),
            Err(_) => (previous, Some(format!("no confirmation within {:?}", limit))),
        };

        match &error {
            None => info!(state = %final_state, "Hotspot toggle confirmed"),
            Some(reason) => warn!(
                reverted_to = %final_state,
                reason = %reason,
                "Hotspot toggle failed"
            ),
        }
        *self.inner.last_error.lock() = error;
        self.inner.state.send_replace(final_state);
    }

    async fn switch(&self, want_active: bool) -> Result<(), ExternalCommandError> {
        let cfg = &self.inner.config;
        let verb = if want_active { "up" } else { "down" };
        let mut argv = cfg.privilege_prefix.clone();
        argv.extend(["nmcli", "con", verb, cfg.connection.as_str()].map(String::from));

        self.inner.runner.run(&argv).await?;

        loop {
            match self.query_active().await {
                Ok(active) if active == want_active => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Hotspot status poll failed"),
            }
            sleep(cfg.poll_interval()).await;
        }
    }

    fn status_argv(&self) -> Vec<String> {
        ["nmcli", "-t", "-f", "ACTIVE,NAME", "con", "show"]
            .map(String::from)
            .to_vec()
    }

    async fn query_active(&self) -> Result<bool, ExternalCommandError> {
        let output = self.inner.runner.run(&self.status_argv()).await?;
        Ok(connection_active(&output.stdout, &self.inner.config.connection))
    }
}
