//! Camera control and multi-surface synchronization for a Raspberry Pi camera
//!
//! One camera is shared by three control surfaces: a GPIO shutter button,
//! the local touch panel and remote web clients. All of them submit
//! [`Command`]s into a single ordered queue served by the
//! [`CameraController`], which is the only code that touches the camera
//! and the only writer of the [`SettingsStore`]. Preview frames fan out to
//! any number of viewers through a latest-frame-wins [`FrameBroadcaster`].

pub mod camera;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod gallery;
pub mod input;
pub mod power;
pub mod settings;
pub mod streaming;
pub mod web;

pub use command::{Command, CommandBus, CommandOutcome, CommandQueue, CommandSource};
pub use config::Config;
pub use controller::{CameraController, ControllerTimeouts};
pub use error::ControlError;
pub use gallery::{Gallery, PhotoAsset};
pub use settings::{CameraSettings, Iso, PowerState, SettingsSnapshot, SettingsStore, ShutterSpeed};
pub use streaming::{Frame, FrameBroadcaster, RemoteSession, SessionRegistry};
