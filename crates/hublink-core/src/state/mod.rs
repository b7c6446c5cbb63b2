//! Connection state machine and inbound dispatch.

pub mod dispatcher;
pub mod machine;

pub use dispatcher::{AckFrame, HubEvent};
pub use machine::{ConnectionState, StateHandle};
