//! Master side of svman
//!
//! The master accepts slave registrations, dials back to each slave's
//! command listener, keeps the live channels in a [`NodeRegistry`] and
//! evicts nodes whose heartbeats stop answering.
//!
//! Feature subsystems look channels up through [`NodeChannels`] and never
//! wait for a node to reconnect.

#![deny(missing_docs)]

pub mod config;
pub mod health;
pub mod registrar;
pub mod registry;
pub mod server;

pub use config::MasterConfig;
pub use health::{
    GrpcHeartbeatProbe, HealthMonitor, HealthOutcome, HealthPolicy, HeartbeatError,
    HeartbeatProbe,
};
pub use registrar::{
    normalize_address, NodeDialer, NodeRegistrar, OnNodeRegistered, RegistrationError,
};
pub use registry::{
    NodeChannels, NodeEntry, NodeEvent, NodeRegistry, RegistryError, RemovalReason,
    SharedNodeRegistry,
};
pub use server::{MasterError, MasterServer, RegistrarService};
