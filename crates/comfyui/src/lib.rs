//! Client side of the ComfyUI engine: REST calls, the event socket, and
//! per-session upstream connections.

pub mod api;
pub mod client;
pub mod events;
pub mod history;
pub mod manager;
pub mod messages;
pub mod processor;
pub mod queue;
pub mod upstream;
