// ABOUTME: Client connector for a plexus message-routing cluster.
// ABOUTME: Multiplexes command and query channels over managed gRPC streams with flow control and reconnect.

pub mod buffered;
pub mod command;
pub mod error;
pub mod identity;
pub mod query;
pub mod reconnect;
pub mod registration;
pub mod transport;

mod flow;
mod instruction;
mod outbound;
mod pending;
mod reply;

// Channels
pub use command::{CommandChannel, CommandHandler};
pub use query::{
    QueryChannel, QueryDefinition, QueryHandler, QueryResponseSink, SubscriptionQueryResult,
    UpdateHandle, UpdateRegistration,
};

// Channel lifecycle and results
pub use buffered::ResultStream;
pub use outbound::{StreamSender, DEFAULT_CHANNEL_BUFFER};
pub use reconnect::ConnectionState;
pub use registration::Registration;

// Errors and identity
pub use error::{ConnectorError, ErrorCategory};
pub use identity::ClientIdentity;

// Transport configuration
pub use transport::{create_channel, ChannelConfig, ConnectorSettings, KeepAliveConfig};

// Re-export proto types for convenience
pub use plexus_proto;
