/*
This module is home to everything related to the hub the device was
assigned to during provisioning.

It provides the authenticated session, the serialized outbound publish
channel, periodic heartbeat emission, direct method handling and the
reconnection supervisor that rides out transport gaps.
*/

mod heartbeat;
mod methods;
mod session;

pub use heartbeat::start_heartbeat;
pub use methods::{start_method_listener, MethodInvocation, MethodOutcome, MethodRegistry};
pub use session::{
    start_sender, start_supervisor, HubSession, Outbound, SessionConfig, SessionError,
};
