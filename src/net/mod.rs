//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Configured hosts
//!     → address.rs (proto://addr parsing, normalisation)
//!     → tls.rs (security policy, rustls server config)
//!     → listener.rs (deterrent, port reservation, bind)
//!     → connection.rs (per-connection tracking while serving)
//! ```
//!
//! # Design Decisions
//! - The security policy is settled before anything is bound
//! - tcp listeners reserve their ports in the shared allocator first
//! - TLS is negotiated per connection, not in the accept loop

pub mod address;
pub mod connection;
pub mod listener;
pub mod ports;
pub mod tls;

pub use address::{ListenerSpec, Transport};
pub use listener::{ApiListener, DeterrentDelays, ListenerError, ListenerResolver, Resolution};
pub use ports::PortAllocator;
pub use tls::{SecurityClass, SecurityPolicy};
