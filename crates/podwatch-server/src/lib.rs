//! Central server: agent stream ingress, per-node registry with profile
//! request correlation, alert evaluation, and the HTTP control plane.

pub mod api;
pub mod config;
pub mod grpc;
pub mod registry;
pub mod state;
