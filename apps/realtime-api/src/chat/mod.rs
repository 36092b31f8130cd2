pub mod events;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod writeback;
