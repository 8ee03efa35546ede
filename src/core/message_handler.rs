//! Request/response messaging between a document host and its clients.
//!
//! Both ends own a [`MessageHandler`] over one half of a [`Transport`].
//! A request carries a fresh id; the other side runs the handler registered
//! for its action as an independent task and answers with `fulfill` or
//! `reject` under the same id, optionally preceded by `progress` messages.
//! A transport delivers messages in send order.

use super::error::{PDFError, PDFResult};
use super::pending::{BoxFuture, PendingRegistry, PendingValue};
use log::{debug, trace, warn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Fulfill,
    Reject,
    Progress,
    Cancel,
}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub id: u64,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// Payload of a `reject` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&PDFError> for ErrorPayload {
    fn from(err: &PDFError) -> Self {
        ErrorPayload {
            code: err.code().to_string(),
            message: err.message(),
        }
    }
}

impl From<ErrorPayload> for PDFError {
    fn from(payload: ErrorPayload) -> Self {
        PDFError::from_code(&payload.code, payload.message)
    }
}

/// One end of an in-process message channel.
pub struct Transport {
    tx: UnboundedSender<Message>,
    rx: UnboundedReceiver<Message>,
}

impl Transport {
    /// Two connected ends.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Transport { tx: a_tx, rx: b_rx },
            Transport { tx: b_tx, rx: a_rx },
        )
    }
}

/// Sends `progress` messages for the request being handled.
#[derive(Clone)]
pub struct ProgressSink {
    tx: UnboundedSender<Message>,
    id: u64,
    action: String,
}

impl ProgressSink {
    pub fn send(&self, payload: Value) {
        let _ = self.tx.send(Message {
            kind: MessageKind::Progress,
            id: self.id,
            action: self.action.clone(),
            payload,
        });
    }
}

type Handler = Arc<
    dyn Fn(Value, ProgressSink) -> BoxFuture<'static, PDFResult<Value>>
        + Send
        + Sync,
>;

/// A request in flight.
pub struct Request {
    id: u64,
    response: PendingValue<Value>,
    progress: UnboundedReceiver<Value>,
    handler: MessageHandler,
}

impl Request {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next progress payload, `None` once the request settled.
    pub async fn progress(&mut self) -> Option<Value> {
        self.progress.recv().await
    }

    /// Waits for the reply.
    pub async fn response(self) -> PDFResult<Value> {
        self.response.wait().await
    }

    /// Cancels the request on both sides.
    pub fn cancel(&self, reason: &str) {
        self.handler.cancel(self.id, reason);
    }
}

/// Correlates requests and replies over a [`Transport`].
#[derive(Clone)]
pub struct MessageHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    name: String,
    tx: UnboundedSender<Message>,
    next_id: AtomicU64,
    replies: PendingRegistry<Value>,
    progress: Mutex<FxHashMap<u64, UnboundedSender<Value>>>,
    handlers: Mutex<FxHashMap<String, Handler>>,
    running: Mutex<FxHashMap<u64, AbortHandle>>,
    /// Signalled whenever `running` becomes empty.
    idle: Notify,
}

impl MessageHandler {
    /// Starts dispatching messages arriving on `transport`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(name: impl Into<String>, transport: Transport) -> Self {
        let Transport { tx, rx } = transport;
        let handler = MessageHandler {
            inner: Arc::new(HandlerInner {
                name: name.into(),
                tx,
                next_id: AtomicU64::new(1),
                replies: PendingRegistry::new(),
                progress: Mutex::new(FxHashMap::default()),
                handlers: Mutex::new(FxHashMap::default()),
                running: Mutex::new(FxHashMap::default()),
                idle: Notify::new(),
            }),
        };
        tokio::spawn(handler.clone().dispatch(rx));
        handler
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registers the handler for `action`, replacing any previous one.
    pub fn on<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(Value, ProgressSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PDFResult<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(
            move |payload: Value, sink: ProgressSink| -> BoxFuture<'static, PDFResult<Value>> {
                Box::pin(handler(payload, sink))
            },
        );
        lock(&self.inner.handlers).insert(action.to_string(), handler);
    }

    /// Sends a request; the reply is awaited through the returned [`Request`].
    pub fn request(&self, action: &str, payload: Value) -> Request {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self.inner.replies.get_or_create(&id.to_string());
        let (progress_tx, progress) = mpsc::unbounded_channel();
        lock(&self.inner.progress).insert(id, progress_tx);

        let sent = self.inner.tx.send(Message {
            kind: MessageKind::Request,
            id,
            action: action.to_string(),
            payload,
        });
        if sent.is_err() {
            self.settle(id, Err(self.closed()));
        }
        Request {
            id,
            response,
            progress,
            handler: self.clone(),
        }
    }

    /// Sends a request and waits for its reply.
    pub async fn send_with_reply(&self, action: &str, payload: Value) -> PDFResult<Value> {
        self.request(action, payload).response().await
    }

    /// Rejects request `id` locally and asks the other side to abort it.
    pub fn cancel(&self, id: u64, reason: &str) {
        debug!("[{}] cancelling request {}: {}", self.inner.name, id, reason);
        let _ = self.inner.tx.send(Message {
            kind: MessageKind::Cancel,
            id,
            action: String::new(),
            payload: Value::String(reason.to_string()),
        });
        self.settle(id, Err(PDFError::Cancelled(reason.to_string())));
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.replies.len()
    }

    /// Number of incoming requests whose reply has not been sent yet.
    pub fn running_requests(&self) -> usize {
        lock(&self.inner.running).len()
    }

    /// Resolves once every incoming request has been answered.
    pub async fn drained(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.running_requests() == 0 {
                return;
            }
            idle.await;
        }
    }

    fn finish_request(&self, id: u64) -> Option<AbortHandle> {
        let mut running = lock(&self.inner.running);
        let task = running.remove(&id);
        if running.is_empty() {
            self.inner.idle.notify_waiters();
        }
        task
    }

    async fn dispatch(self, mut rx: UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            trace!(
                "[{}] {:?} {} {}",
                self.inner.name,
                message.kind,
                message.id,
                message.action
            );
            match message.kind {
                MessageKind::Request => self.handle_request(message),
                MessageKind::Fulfill => self.settle(message.id, Ok(message.payload)),
                MessageKind::Reject => {
                    let err = match serde_json::from_value::<ErrorPayload>(message.payload) {
                        Ok(payload) => payload.into(),
                        Err(err) => PDFError::from(err),
                    };
                    self.settle(message.id, Err(err));
                }
                MessageKind::Progress => {
                    if let Some(tx) = lock(&self.inner.progress).get(&message.id) {
                        let _ = tx.send(message.payload);
                    }
                }
                MessageKind::Cancel => {
                    if let Some(task) = self.finish_request(message.id) {
                        task.abort();
                    }
                }
            }
        }

        debug!("[{}] transport closed", self.inner.name);
        self.inner.replies.reject_all(self.closed());
        self.inner.replies.clear();
        lock(&self.inner.progress).clear();
        for (_, task) in lock(&self.inner.running).drain() {
            task.abort();
        }
        self.inner.idle.notify_waiters();
    }

    fn handle_request(&self, message: Message) {
        let Message {
            id, action, payload, ..
        } = message;
        let Some(handler) = lock(&self.inner.handlers).get(&action).cloned() else {
            warn!("[{}] no handler for action '{}'", self.inner.name, action);
            let err = PDFError::Generic(format!("Unknown action: {}", action));
            self.reply(id, &action, Err(err));
            return;
        };

        let sink = ProgressSink {
            tx: self.inner.tx.clone(),
            id,
            action: action.clone(),
        };
        let this = self.clone();
        // Holding the lock across the spawn keeps the task from finishing
        // (and removing itself) before it is registered.
        let mut running = lock(&self.inner.running);
        let task = tokio::spawn(async move {
            let outcome = handler(payload, sink).await;
            this.reply(id, &action, outcome);
            this.finish_request(id);
        });
        running.insert(id, task.abort_handle());
    }

    fn reply(&self, id: u64, action: &str, outcome: PDFResult<Value>) {
        let message = match outcome {
            Ok(payload) => Message {
                kind: MessageKind::Fulfill,
                id,
                action: action.to_string(),
                payload,
            },
            Err(err) => Message {
                kind: MessageKind::Reject,
                id,
                action: action.to_string(),
                payload: serde_json::to_value(ErrorPayload::from(&err)).unwrap_or(Value::Null),
            },
        };
        if self.inner.tx.send(message).is_err() {
            debug!("[{}] reply to {} dropped, transport closed", self.inner.name, id);
        }
    }

    fn settle(&self, id: u64, outcome: PDFResult<Value>) {
        let key = id.to_string();
        if let Some(pending) = self.inner.replies.remove(&key) {
            let _ = pending.settle(outcome);
        }
        lock(&self.inner.progress).remove(&id);
    }

    fn closed(&self) -> PDFError {
        PDFError::Cancelled(format!("{}: transport closed", self.inner.name))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
