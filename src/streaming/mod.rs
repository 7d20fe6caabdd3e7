pub mod frame_broadcaster;
pub mod session;

pub use frame_broadcaster::{BroadcastStats, Frame, FrameBroadcaster, FrameSubscription};
pub use session::{RemoteSession, SessionInfo, SessionKind, SessionRegistry};
