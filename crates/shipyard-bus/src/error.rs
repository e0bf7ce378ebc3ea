use thiserror::Error;

/// Errors raised while routing a message.
#[derive(Debug, Error)]
pub enum BusError {
    /// Nothing is bound to this request name.
    #[error("no handler registered for {name}")]
    NoHandlerRegistered { name: String },

    /// The name is not known to the marshaller, so its payload cannot be decoded.
    #[error("unknown message: {name}")]
    UnknownMessage { name: String },

    #[error("could not decode {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A handler was given, or returned, a value of the wrong type.
    #[error("unexpected payload type for {name}")]
    UnexpectedPayload { name: String },

    /// Error returned by a handler, passed through untouched.
    #[error(transparent)]
    Handler(anyhow::Error),
}

impl BusError {
    /// Short, stable error code string for logs and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            BusError::NoHandlerRegistered { .. } => "no_handler_registered",
            BusError::UnknownMessage { .. } => "unknown_message",
            BusError::Decode { .. } => "decode_failed",
            BusError::Encode(_) => "encode_failed",
            BusError::UnexpectedPayload { .. } => "unexpected_payload",
            BusError::Handler(_) => "handler_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
