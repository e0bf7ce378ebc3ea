//! `shipyard-bus` — in-process message bus.
//!
//! # Overview
//!
//! Every message has a stable [`Message::NAME`] used as the registry key.
//! Requests (commands and queries) have exactly one handler and produce a
//! typed result; signals have any number of handlers, run in registration
//! order.
//!
//! | Shape          | Registered with        | Dispatched with   |
//! |----------------|------------------------|-------------------|
//! | Command/Query  | [`Bus::register`]      | [`Bus::send`]     |
//! | Async request  | [`Bus::register_async`]| the worker pool   |
//! | Signal         | [`Bus::on`]            | [`Bus::notify`]   |
//!
//! Async requests are also registered in the bus's [`Marshaller`] so a
//! persisted job can be decoded back into a request by name.

pub mod bus;
pub mod error;
pub mod marshal;
pub mod message;

pub use bus::{tracing_middleware, Bus, Envelope, HandlerFuture, Middleware, Next, Payload};
pub use error::{BusError, Result};
pub use marshal::Marshaller;
pub use message::{AnySignal, AsyncRequest, AsyncResult, Message, MessageKind, Request, Signal, Unit};
