//! # AgentCom: agent message hub and task dispatcher
//!
//! AgentCom connects autonomous worker agents to a central coordinator.
//! Agents attach over persistent WebSocket sessions; offline agents fetch
//! queued traffic by HTTP polling. On top of raw messaging the hub runs a
//! task-dispatch pipeline: work items are submitted, classified by
//! complexity, routed to an execution tier, assigned to a worker, tracked
//! through a generation-fenced lifecycle, reclaimed when the worker
//! disappears, and retried with bounded attempts.
//!
//! ## Architecture
//!
//! Every stateful component wraps a durable [`storage::KvTable`] plus an
//! in-memory index, and components talk through explicit `Arc` handles wired
//! up by [`hub::Hub`]. Fan-out rides an in-process topic bus; sessions and
//! HTTP handlers are the only boundary layers.

pub mod auth;
pub mod bus;
pub mod channels;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod domain_types;
pub mod error;
pub mod goals;
pub mod http_api;
pub mod hub;
pub mod mailbox;
pub mod message;
pub mod presence;
pub mod protocol;
pub mod rate_limit;
pub mod reaper;
pub mod repos;
pub mod router;
pub mod session;
pub mod settings;
pub mod storage;
pub mod tasks;
pub mod threads;

pub use crate::config::HubConfig;
pub use crate::error::HubError;
pub use crate::hub::Hub;
