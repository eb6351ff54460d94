//! Slave side of svman
//!
//! A slave serves the command listener the master dials back to, registers
//! with the master and keeps that session alive: a passive watcher follows
//! the channel's connectivity, an active heartbeat pings the master, and any
//! degradation restarts the session after a bounded backoff.

#![deny(missing_docs)]

pub mod config;
pub mod heartbeat;
pub mod link;
pub mod listener;
pub mod node;
pub mod session;
pub mod watcher;

pub use config::SlaveConfig;
pub use link::{GrpcMasterLink, MasterLink, SessionError};
pub use listener::{CommandListenerService, CommandServer, ListenerError};
pub use node::SlaveNode;
pub use session::{MonitorExit, Session, SessionState};
pub use watcher::{next_action, WatchAction, WatchExit};
