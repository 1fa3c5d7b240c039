//! Cumulus Shared Base Crate
//!
//! Type definitions shared between the Cumulus provisioner and its clients:
//! provisioning options and their layering, the cloud / template model,
//! label expressions and the HTTP API bodies. This crate performs no I/O.

pub mod api;
pub mod cloud;
pub mod label;
pub mod options;
pub mod util;
