//! Protocol buffer definitions for master/slave node communication
//!
//! Generated from `proto/node.proto`. The master serves [`Registrar`], every
//! slave serves [`CommandListener`].
//!
//! [`Registrar`]: registrar_server::Registrar
//! [`CommandListener`]: command_listener_server::CommandListener

#![allow(clippy::derive_partial_eq_without_eq)]

tonic::include_proto!("svman.node.v1");
