// ABOUTME: Error types and wire error categories for the plexus connector.
// ABOUTME: Provides structured errors for channel, instruction, and dispatch operations.

use plexus_proto::ErrorMessage;
use thiserror::Error;

/// Stable error categories carried on the wire.
///
/// The string form of a category is the identifier the server (and other
/// clients) key on, so these must never change once published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No handler is registered for the dispatched command.
    NoHandlerForCommand,
    /// No handler is registered for the dispatched query.
    NoHandlerForQuery,
    /// A registered command handler failed while executing.
    CommandExecutionError,
    /// The command could not be dispatched to the server.
    CommandDispatchError,
    /// A registered query handler failed while executing.
    QueryExecutionError,
    /// The peer sent a frame kind this client does not understand.
    UnsupportedInstruction,
}

impl ErrorCategory {
    /// The stable wire identifier for this category.
    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorCategory::NoHandlerForCommand => "NO_HANDLER_FOR_COMMAND",
            ErrorCategory::NoHandlerForQuery => "NO_HANDLER_FOR_QUERY",
            ErrorCategory::CommandExecutionError => "COMMAND_EXECUTION_ERROR",
            ErrorCategory::CommandDispatchError => "COMMAND_DISPATCH_ERROR",
            ErrorCategory::QueryExecutionError => "QUERY_EXECUTION_ERROR",
            ErrorCategory::UnsupportedInstruction => "UNSUPPORTED_INSTRUCTION",
        }
    }

    /// Build a wire [`ErrorMessage`] for this category.
    pub fn error_message(&self, message: impl Into<String>, location: impl Into<String>) -> ErrorMessage {
        ErrorMessage {
            message: message.into(),
            location: location.into(),
            details: Vec::new(),
            error_code: self.error_code().to_string(),
        }
    }
}

/// Errors surfaced by the connector.
///
/// Cloneable so that a single transport failure can fail every pending
/// instruction awaiting an ack.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    /// Invalid server address format.
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// Failed to connect to the server.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Stream was closed unexpectedly.
    #[error("stream closed unexpectedly")]
    StreamClosed,

    /// Error on the gRPC stream.
    #[error("stream error: {0}")]
    StreamError(String),

    /// The server rejected an instruction with a nack.
    #[error("instruction rejected [{code}]: {message}")]
    InstructionFailed { code: String, message: String },

    /// A command could not be handed to the transport for dispatching.
    #[error("command dispatch failed: {message}")]
    DispatchFailed { message: String },

    /// The channel was explicitly disconnected while work was outstanding.
    #[error("channel disconnected")]
    Disconnected,
}

impl ConnectorError {
    /// The wire category for this error, when one applies.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ConnectorError::DispatchFailed { .. } => Some(ErrorCategory::CommandDispatchError),
            _ => None,
        }
    }

    /// Build the error carried by a failed instruction ack.
    ///
    /// Server-supplied codes are propagated verbatim.
    pub(crate) fn from_ack_error(error: Option<ErrorMessage>) -> Self {
        match error {
            Some(err) => ConnectorError::InstructionFailed {
                code: err.error_code,
                message: err.message,
            },
            None => ConnectorError::InstructionFailed {
                code: String::new(),
                message: "instruction not acknowledged".to_string(),
            },
        }
    }
}

impl From<tonic::Status> for ConnectorError {
    fn from(status: tonic::Status) -> Self {
        ConnectorError::StreamError(status.to_string())
    }
}

impl From<tonic::transport::Error> for ConnectorError {
    fn from(err: tonic::transport::Error) -> Self {
        ConnectorError::ConnectionFailed(err.to_string())
    }
}
