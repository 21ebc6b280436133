pub mod agent;
pub mod api;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod engine;
pub mod escalation;
pub mod idempotency;
pub mod identity;
pub mod kb;
pub mod queue;
pub mod shared;
pub mod store;
pub mod tickets;
