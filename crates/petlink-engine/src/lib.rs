//! Runtime half of the companion: the self-healing channel to the worker, the
//! single control loop that feeds it into the state machines, and the window
//! lifecycle that decides when the worker is torn down.

pub mod channel;
pub mod companion;
pub mod lifecycle;

pub use channel::{ChannelEvent, EventName, LinkState, MessageChannel};
pub use companion::{CompanionHandle, CompanionView, UiCommand};
pub use lifecycle::{CloseDecision, Lifecycle, WindowLifecycleController, WindowShell};
