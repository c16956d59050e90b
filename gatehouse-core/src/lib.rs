//! Configuration and KMS substrate shared by gatehouse controllers and
//! workers.
//!
//! Two concerns live here because every node role needs both before anything
//! else can start:
//! - [`config`]: the declarative configuration tree, its loader, and the
//!   listener/upstream topology validation rules
//! - [`kms`]: named key-management wrappers resolved by purpose
//!
//! Secret-bearing values in the configuration may use `env://NAME`,
//! `file://PATH`, or `enc://BASE64` indirection; see [`indirection`].

pub mod config;
pub mod indirection;
pub mod kms;

pub use config::{Config, ConfigError, Role};
pub use kms::{KmsError, KmsPurpose, KmsRegistry, Wrapper};
