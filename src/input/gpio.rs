//! Physical shutter button
//!
//! The interrupt callback only forwards the edge time; debouncing and
//! command submission happen on the async side.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::log_outcome;
use crate::command::{Command, CommandBus, CommandSource, PendingReply};
use crate::error::ControlError;

/// Accepts at most one edge per window
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_accepted: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: None,
        }
    }

    pub fn accept(&mut self, at: Instant) -> bool {
        match self.last_accepted {
            Some(last) if at.saturating_duration_since(last) < self.window => false,
            _ => {
                self.last_accepted = Some(at);
                true
            }
        }
    }
}

#[derive(Debug)]
pub enum EdgeOutcome {
    Debounced,
    Submitted(PendingReply),
    Rejected(ControlError),
}

pub struct ButtonSource {
    bus: CommandBus,
    debouncer: Debouncer,
}

impl ButtonSource {
    pub fn new(bus: CommandBus, debounce: Duration) -> Self {
        Self {
            bus,
            debouncer: Debouncer::new(debounce),
        }
    }

    /// A falling edge on the button pin means "take a photo"
    pub async fn on_edge(&mut self, at: Instant) -> EdgeOutcome {
        if !self.debouncer.accept(at) {
            debug!("Button bounce ignored");
            return EdgeOutcome::Debounced;
        }
        match self.bus.enqueue(CommandSource::Gpio, Command::Capture, None).await {
            Ok(pending) => EdgeOutcome::Submitted(pending),
            Err(e) => EdgeOutcome::Rejected(e),
        }
    }

    pub fn spawn(mut self, mut edges: mpsc::UnboundedReceiver<Instant>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(at) = edges.recv().await {
                match self.on_edge(at).await {
                    EdgeOutcome::Debounced => {}
                    EdgeOutcome::Submitted(pending) => {
                        tokio::spawn(log_outcome(CommandSource::Gpio, "capture".into(), pending));
                    }
                    EdgeOutcome::Rejected(e) => info!(error = %e, "Button capture rejected"),
                }
            }
            debug!("Button source stopped");
        })
    }
}

#[cfg(all(feature = "gpio", any(target_arch = "arm", target_arch = "aarch64")))]
pub use pin::ButtonPin;

#[cfg(all(feature = "gpio", any(target_arch = "arm", target_arch = "aarch64")))]
mod pin {
    use super::*;
    use anyhow::Result;
    use rppal::gpio::{Gpio, InputPin, Trigger};

    /// Keeps the interrupt registered for as long as it lives
    pub struct ButtonPin {
        _pin: InputPin,
    }

    impl ButtonPin {
        /// Watch `bcm_pin` (pulled up, pressed = low) and forward edges
        pub fn watch(bcm_pin: u8) -> Result<(Self, mpsc::UnboundedReceiver<Instant>)> {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut pin = Gpio::new()?.get(bcm_pin)?.into_input_pullup();
            pin.set_async_interrupt(Trigger::FallingEdge, None, move |_event| {
                let _ = tx.send(Instant::now());
            })?;
            info!(pin = bcm_pin, "Shutter button armed");
            Ok((Self { _pin: pin }, rx))
        }
    }
}
