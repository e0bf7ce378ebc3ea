use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::bus::Payload;

/// What a message does, so middlewares can adapt (e.g. a command may need a
/// transaction whereas a query does not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Notification,
    Command,
    Query,
}

/// Anything that can travel on the bus.
///
/// `NAME` is the discriminator used for handler lookup and for persisted
/// marshalling, so it must never change once jobs carrying it exist.
pub trait Message: Send + 'static {
    const NAME: &'static str;
    const KIND: MessageKind;

    fn name(&self) -> &'static str {
        Self::NAME
    }
}

/// A message with exactly one handler and a typed result.
pub trait Request: Message {
    type Output: Send + 'static;
}

/// Fire-and-forget notification; zero or more handlers.
pub trait Signal: Message + Clone + Sync {}

/// Outcome of an async request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncResult {
    Processed,
    /// Preconditions are not met yet; run again later without recording a failure.
    Delay,
}

/// A command executed out of the request path by the worker pool.
///
/// Handlers must be idempotent: the same request is redelivered after a
/// `Delay` or a failure.
pub trait AsyncRequest: Request<Output = AsyncResult> + Serialize + DeserializeOwned {
    /// Primary entity affected, used for merging and resource-wide waits.
    fn resource_id(&self) -> String;

    /// Serialization key. `None` lets the scheduler pick one.
    fn group(&self) -> Option<String> {
        None
    }
}

/// Result of commands with nothing meaningful to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit;

/// Object-safe view of a signal, so batches of different signal types can
/// be notified together.
pub trait AnySignal: Send + Sync {
    fn signal_name(&self) -> &'static str;
    fn to_payload(&self) -> Payload;
}

impl<S: Signal> AnySignal for S {
    fn signal_name(&self) -> &'static str {
        S::NAME
    }

    fn to_payload(&self) -> Payload {
        Box::new(self.clone())
    }
}
