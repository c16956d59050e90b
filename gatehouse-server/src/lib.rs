//! The gatehouse server: an identity-aware session broker node.
//!
//! One process runs a controller (control plane: database, worker
//! authorization, session coordination), a worker (data plane: session
//! ingress and upstream attachment), or both. The [`supervisor`] module
//! composes the shared substrate (configuration, KMS wrappers, listeners,
//! the schema guard) and owns the signal dispatch loop.

pub mod cluster;
pub mod controller;
pub mod listener;
pub mod logging;
pub mod process;
pub mod schema;
pub mod supervisor;
pub mod worker;
