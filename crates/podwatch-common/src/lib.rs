//! Shared domain model and wire protocol for the podwatch agent/server pair.
//!
//! The [`types`] module holds the serde-facing domain model (one
//! [`types::NodeSnapshot`] per sampling tick). The [`proto`] module holds the
//! protobuf message types and the gRPC client/server plumbing for the
//! bidirectional agent stream; [`convert`] maps between the two.

pub mod convert;
pub mod proto;
pub mod types;
