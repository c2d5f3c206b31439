//! # NDT Server
//!
//! The diagnostic server around `ndt-proto` and `ndt-diag`:
//!
//! - [`config`]: TOML and CLI configuration
//! - [`server`]: control listener and driver loop
//! - [`scheduler`]: admission queue, dispatch, eviction and zombie probes
//! - [`session`]: one admitted client, login to logout
//! - [`runners`]: the Middlebox, SFW, C2S, S2C and Meta test phases
//! - [`control`]: framed control channel over a socket
//! - [`listener`]: test listeners, port allocation, bounded accept
//! - [`counters`]: per-connection TCP counters from the kernel
//! - [`capture`]: packet capture feeding the packet-pair classifier
//! - [`sampler`]: CWND peak sampler and snaplog writer
//! - [`record`]: meta records and the summary log

pub mod capture;
pub mod config;
pub mod control;
pub mod counters;
pub mod listener;
pub mod record;
pub mod runners;
pub mod sampler;
pub mod scheduler;
pub mod server;
pub mod session;

pub use config::{ServerConfig, ServerConfigInput};
pub use control::{ControlChannel, ControlError};
pub use counters::{CounterError, CounterStore, FixedCounterStore, TcpInfoStore};
pub use scheduler::{SchedulerFault, SchedulerHandle, SchedulerState};
pub use server::Server;
