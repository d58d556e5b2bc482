// ABOUTME: Re-exports generated protobuf types for the plexus wire protocol.
// ABOUTME: Single source of truth for plexus gRPC services and message types.

#![allow(clippy::derive_partial_eq_without_eq)]

/// Generated protobuf types for the plexus protocol.
pub mod plexus {
    tonic::include_proto!("plexus");
}

// Re-export commonly used types at crate root for convenience
pub use plexus::*;

// Re-export client types under a client module
pub mod client {
    pub use super::plexus::command_service_client::CommandServiceClient;
    pub use super::plexus::query_service_client::QueryServiceClient;
}

// Re-export server types under a server module
pub mod server {
    pub use super::plexus::command_service_server::{CommandService, CommandServiceServer};
    pub use super::plexus::query_service_server::{QueryService, QueryServiceServer};
}
