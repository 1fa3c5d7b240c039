//! OpenStack-backed CI worker provisioner.

pub mod auth;
pub mod config;
pub mod openstack;
pub mod perms;
pub mod provision;
pub mod routes;
pub mod serve;
pub mod store;
