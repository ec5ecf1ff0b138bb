//! shakenfist-client - async bindings for the Shaken Fist REST API
//!
//! Covers the namespace, key, network and instance operations needed to
//! provision short-lived load-test environments.
//!
//! ## Modules
//!
//! - [`client`]: authenticated HTTP client
//! - [`control_plane`]: the `ControlPlane` trait seam used by orchestration code
//! - [`error`]: error type and classification helpers
//! - [`types`]: request and response bodies

pub mod client;
pub mod control_plane;
pub mod error;
pub mod types;

pub use client::Client;
pub use control_plane::ControlPlane;
pub use error::{ClientError, Result};
pub use types::{CreateInstance, CreateNetwork, DiskSpec, Instance, Network, NetworkSpec, VideoSpec};
