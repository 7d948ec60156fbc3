//! # WuRemote Service
//!
//! Orchestration core for remote control of a host's update pipeline:
//!
//! - [`update`]: state machine, job supervision and the update controller
//! - [`broadcast`]: observer registry fanning events out to clients
//! - [`service`]: the facade exposed to hosting layers
//! - [`http_server`]: axum host with REST routes and a callback WebSocket

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod http_server;
pub mod server;
pub mod service;
pub mod update;

pub use broadcast::{CallbackEvent, Liveness, Observer, ObserverRegistry};
pub use service::{ServiceOptions, WuRemoteService};
pub use update::{ServiceError, Settings, WuState};
