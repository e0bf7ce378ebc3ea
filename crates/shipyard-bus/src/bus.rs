use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::marshal::Marshaller;
use crate::message::{AnySignal, AsyncRequest, AsyncResult, MessageKind, Request, Signal};

/// Type-erased message or result travelling through the handler chain.
pub type Payload = Box<dyn Any + Send>;

pub type HandlerFuture = BoxFuture<'static, Result<Payload>>;

/// A handler as seen by middlewares.
pub type Next = Arc<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

/// Wraps a handler with cross-cutting behavior. Applied once, at registration.
pub type Middleware = Arc<dyn Fn(Next) -> Next + Send + Sync>;

/// A message on its way to a handler.
pub struct Envelope {
    pub name: &'static str,
    pub kind: MessageKind,
    pub message: Payload,
}

enum Handlers {
    Request(Next),
    /// Kept in registration order.
    Signal(Vec<Next>),
}

struct Entry {
    name: &'static str,
    kind: MessageKind,
    handlers: Handlers,
}

/// In-process mediator routing messages to their handlers by name.
///
/// Registration happens at startup through `&self`, so a single bus can be
/// shared as `Arc<Bus>` while domain modules register against it.
pub struct Bus {
    middlewares: Vec<Middleware>,
    entries: RwLock<HashMap<&'static str, Entry>>,
    marshaller: Marshaller,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_middlewares(Vec::new())
    }

    /// The first middleware is the outermost one: it sees the message before,
    /// and the result after, every other middleware.
    pub fn with_middlewares(middlewares: Vec<Middleware>) -> Self {
        Self {
            middlewares,
            entries: RwLock::new(HashMap::new()),
            marshaller: Marshaller::new(),
        }
    }

    pub fn marshaller(&self) -> &Marshaller {
        &self.marshaller
    }

    /// Bind the single handler of request `R`.
    ///
    /// # Panics
    ///
    /// Panics if `R::NAME` already has a handler; this only happens on a
    /// miswired startup.
    pub fn register<R, F, Fut>(&self, handler: F)
    where
        R: Request,
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R::Output>> + Send + 'static,
    {
        let next = self.wrap(erase::<R, F, Fut>(handler));
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if entries.contains_key(R::NAME) {
            panic!("a handler is already registered for {}", R::NAME);
        }

        entries.insert(
            R::NAME,
            Entry {
                name: R::NAME,
                kind: R::KIND,
                handlers: Handlers::Request(next),
            },
        );
        debug!(message_name = R::NAME, kind = ?R::KIND, "request handler registered");
    }

    /// Bind the handler of an async request and make it decodable from the job store.
    pub fn register_async<R, F, Fut>(&self, handler: F)
    where
        R: AsyncRequest,
        F: Fn(R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<AsyncResult>> + Send + 'static,
    {
        self.register::<R, F, Fut>(handler);
        self.marshaller.register::<R>();
    }

    /// Add a handler for signal `S`. Any number of handlers may be added.
    pub fn on<S, F, Fut>(&self, handler: F)
    where
        S: Signal,
        F: Fn(S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let next = self.wrap(erase::<S, F, Fut>(handler));
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let entry = entries.entry(S::NAME).or_insert_with(|| Entry {
            name: S::NAME,
            kind: MessageKind::Notification,
            handlers: Handlers::Signal(Vec::new()),
        });

        match entry.handlers {
            Handlers::Signal(ref mut handlers) => handlers.push(next),
            Handlers::Request(_) => {
                panic!("{} is already registered as a request", S::NAME)
            }
        }
        debug!(message_name = S::NAME, "signal handler registered");
    }

    /// Send a request to its handler and return the typed result.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Output> {
        let result = self.dispatch(R::NAME, Box::new(request)).await?;
        result
            .downcast::<R::Output>()
            .map(|out| *out)
            .map_err(|_| BusError::UnexpectedPayload {
                name: R::NAME.to_string(),
            })
    }

    /// Decode a persisted async request by name and run it.
    pub async fn send_persisted(&self, name: &str, data: &str) -> Result<AsyncResult> {
        let request = self.marshaller.decode(name, data)?;
        let result = self.dispatch(name, request).await?;
        result
            .downcast::<AsyncResult>()
            .map(|out| *out)
            .map_err(|_| BusError::UnexpectedPayload {
                name: name.to_string(),
            })
    }

    /// Type-erased dispatch of a request payload to the handler bound to `name`.
    pub async fn dispatch(&self, name: &str, message: Payload) -> Result<Payload> {
        let (name, kind, next) = self.request_handler(name)?;
        next(Envelope {
            name,
            kind,
            message,
        })
        .await
    }

    /// Run every handler of every signal, in order.
    ///
    /// Stops at the first handler error and returns it; remaining handlers
    /// and later signals are not invoked.
    pub async fn notify(&self, signals: &[&dyn AnySignal]) -> Result<()> {
        for signal in signals {
            let name = signal.signal_name();
            for next in self.signal_handlers(name) {
                next(Envelope {
                    name,
                    kind: MessageKind::Notification,
                    message: signal.to_payload(),
                })
                .await?;
            }
        }
        Ok(())
    }

    // --- private helpers ---------------------------------------------------

    fn wrap(&self, handler: Next) -> Next {
        self.middlewares
            .iter()
            .rev()
            .fold(handler, |next, middleware| middleware(next))
    }

    fn request_handler(&self, name: &str) -> Result<(&'static str, MessageKind, Next)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(name) {
            Some(Entry {
                name,
                kind,
                handlers: Handlers::Request(next),
            }) => Ok((*name, *kind, Arc::clone(next))),
            _ => Err(BusError::NoHandlerRegistered {
                name: name.to_string(),
            }),
        }
    }

    fn signal_handlers(&self, name: &str) -> Vec<Next> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(name) {
            Some(Entry {
                handlers: Handlers::Signal(handlers),
                ..
            }) => handlers.clone(),
            _ => Vec::new(),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn a typed handler into a [`Next`] working on payloads.
fn erase<M, F, Fut>(handler: F) -> Next
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: IntoPayload,
{
    let handler = Arc::new(handler);
    Arc::new(move |envelope: Envelope| {
        let handler = Arc::clone(&handler);
        async move {
            let message = envelope
                .message
                .downcast::<M>()
                .map_err(|_| BusError::UnexpectedPayload {
                    name: envelope.name.to_string(),
                })?;
            handler(*message).await.into_payload()
        }
        .boxed()
    })
}

trait IntoPayload {
    fn into_payload(self) -> Result<Payload>;
}

impl<T: Send + 'static> IntoPayload for anyhow::Result<T> {
    fn into_payload(self) -> Result<Payload> {
        self.map(|out| Box::new(out) as Payload)
            .map_err(BusError::Handler)
    }
}

/// Logs every dispatched message at debug level with its duration.
pub fn tracing_middleware() -> Middleware {
    Arc::new(|next: Next| -> Next {
        Arc::new(move |envelope: Envelope| {
            let next = Arc::clone(&next);
            async move {
                let name = envelope.name;
                let kind = envelope.kind;
                let started = Instant::now();
                let result = next(envelope).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                match &result {
                    Ok(_) => debug!(message_name = name, ?kind, duration_ms, "message handled"),
                    Err(e) => debug!(message_name = name, ?kind, duration_ms, error = %e, "message failed"),
                }
                result
            }
            .boxed()
        })
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::message::Message;

    #[derive(Debug)]
    struct Add {
        a: i32,
        b: i32,
    }

    impl Message for Add {
        const NAME: &'static str = "test.command.add";
        const KIND: MessageKind = MessageKind::Command;
    }

    impl Request for Add {
        type Output = i32;
    }

    #[derive(Debug)]
    struct GetCount;

    impl Message for GetCount {
        const NAME: &'static str = "test.query.get_count";
        const KIND: MessageKind = MessageKind::Query;
    }

    impl Request for GetCount {
        type Output = usize;
    }

    #[derive(Debug, Clone)]
    struct SomethingCreated {
        id: u32,
    }

    impl Message for SomethingCreated {
        const NAME: &'static str = "test.event.something_created";
        const KIND: MessageKind = MessageKind::Notification;
    }

    impl Signal for SomethingCreated {}

    #[derive(Debug, Clone)]
    struct SomethingDeleted;

    impl Message for SomethingDeleted {
        const NAME: &'static str = "test.event.something_deleted";
        const KIND: MessageKind = MessageKind::Notification;
    }

    impl Signal for SomethingDeleted {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Deploy {
        app: String,
    }

    impl Message for Deploy {
        const NAME: &'static str = "test.command.deploy";
        const KIND: MessageKind = MessageKind::Command;
    }

    impl Request for Deploy {
        type Output = AsyncResult;
    }

    impl AsyncRequest for Deploy {
        fn resource_id(&self) -> String {
            self.app.clone()
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("app is locked")]
    struct AppLocked;

    #[tokio::test]
    async fn send_returns_handler_result() {
        let bus = Bus::new();
        bus.register(|cmd: Add| async move { Ok(cmd.a + cmd.b) });

        assert_eq!(bus.send(Add { a: 1, b: 2 }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn send_without_handler_fails() {
        let bus = Bus::new();
        let err = bus.send(GetCount).await.unwrap_err();
        assert!(matches!(err, BusError::NoHandlerRegistered { ref name } if name == GetCount::NAME));
    }

    #[tokio::test]
    async fn handler_errors_are_passed_through() {
        let bus = Bus::new();
        bus.register(|_: Add| async move { Err::<i32, _>(anyhow::Error::new(AppLocked)) });

        let err = bus.send(Add { a: 0, b: 0 }).await.unwrap_err();
        match err {
            BusError::Handler(inner) => assert!(inner.downcast_ref::<AppLocked>().is_some()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    #[should_panic(expected = "a handler is already registered")]
    fn registering_a_request_twice_panics() {
        let bus = Bus::new();
        bus.register(|_: GetCount| async move { Ok(0) });
        bus.register(|_: GetCount| async move { Ok(1) });
    }

    #[tokio::test]
    async fn signal_handlers_run_in_registration_order() {
        let bus = Bus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let calls = Arc::clone(&calls);
            bus.on(move |evt: SomethingCreated| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.lock().unwrap().push(format!("{label}:{}", evt.id));
                    Ok(())
                }
            });
        }

        bus.notify(&[&SomethingCreated { id: 7 }]).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["first:7", "second:7", "third:7"]);
    }

    #[tokio::test]
    async fn notify_stops_at_first_error() {
        let bus = Bus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = Arc::clone(&calls);
        bus.on(move |_: SomethingCreated| {
            let c = Arc::clone(&c);
            async move {
                c.lock().unwrap().push("created:ok");
                Ok(())
            }
        });
        bus.on(|_: SomethingCreated| async move { Err(anyhow::anyhow!("boom")) });
        let c = Arc::clone(&calls);
        bus.on(move |_: SomethingCreated| {
            let c = Arc::clone(&c);
            async move {
                c.lock().unwrap().push("created:after");
                Ok(())
            }
        });
        let c = Arc::clone(&calls);
        bus.on(move |_: SomethingDeleted| {
            let c = Arc::clone(&c);
            async move {
                c.lock().unwrap().push("deleted");
                Ok(())
            }
        });

        let err = bus
            .notify(&[&SomethingCreated { id: 1 }, &SomethingDeleted])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(*calls.lock().unwrap(), vec!["created:ok"]);
    }

    #[tokio::test]
    async fn notify_without_handlers_is_a_no_op() {
        let bus = Bus::new();
        bus.notify(&[&SomethingDeleted]).await.unwrap();
    }

    #[tokio::test]
    async fn first_middleware_is_outermost() {
        let trace = Arc::new(Mutex::new(Vec::new()));

        let recorder = |label: &'static str, trace: Arc<Mutex<Vec<String>>>| -> Middleware {
            Arc::new(move |next: Next| -> Next {
                let trace = Arc::clone(&trace);
                Arc::new(move |envelope: Envelope| {
                    let next = Arc::clone(&next);
                    let trace = Arc::clone(&trace);
                    async move {
                        trace.lock().unwrap().push(format!("{label}:before:{:?}", envelope.kind));
                        let result = next(envelope).await;
                        trace.lock().unwrap().push(format!("{label}:after"));
                        result
                    }
                    .boxed()
                })
            })
        };

        let bus = Bus::with_middlewares(vec![
            recorder("a", Arc::clone(&trace)),
            recorder("b", Arc::clone(&trace)),
        ]);
        let t = Arc::clone(&trace);
        bus.register(move |_: GetCount| {
            let t = Arc::clone(&t);
            async move {
                t.lock().unwrap().push("handler".to_string());
                Ok(42)
            }
        });

        assert_eq!(bus.send(GetCount).await.unwrap(), 42);
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["a:before:Query", "b:before:Query", "handler", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn async_requests_are_registered_for_marshalling() {
        let bus = Bus::new();
        bus.register(|_: Add| async move { Ok(0) });
        bus.register_async(|cmd: Deploy| async move {
            Ok(if cmd.app == "later" { AsyncResult::Delay } else { AsyncResult::Processed })
        });

        assert!(!bus.marshaller().is_registered(Add::NAME));
        assert!(bus.marshaller().is_registered(Deploy::NAME));

        let result = bus.send_persisted(Deploy::NAME, r#"{"app":"later"}"#).await.unwrap();
        assert_eq!(result, AsyncResult::Delay);
    }

    #[tokio::test]
    async fn persisted_send_of_unknown_message_fails() {
        let bus = Bus::new();
        let err = bus.send_persisted("test.command.missing", "{}").await.unwrap_err();
        assert_eq!(err.code(), "unknown_message");
    }

    #[tokio::test]
    async fn tracing_middleware_is_transparent() {
        let bus = Bus::with_middlewares(vec![tracing_middleware()]);
        bus.register(|cmd: Add| async move { Ok(cmd.a * cmd.b) });
        assert_eq!(bus.send(Add { a: 2, b: 3 }).await.unwrap(), 6);
    }
}
