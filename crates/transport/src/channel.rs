//! Bidirectional RPC over one framed byte stream.
//!
//! A channel owns a reader task and a writer task. Calls are correlated by
//! id, never by arrival order. Data frames fan out to subscribers according
//! to their stream tag.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use nanoid::nanoid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::RpcError;
use crate::message::{CustomEvent, Frame, RpcInvoke, RpcResponse, WireMessage};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5_000);

const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

pub type OperationHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Which frames a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFilter {
    /// Frames tagged with this name, plus untagged broadcasts.
    Tag(String),
    /// Untagged frames only.
    Untagged,
    /// Every frame; the subscriber routes by tag itself.
    Any,
}

impl StreamFilter {
    pub fn accepts(&self, tag: Option<&str>) -> bool {
        match (self, tag) {
            (StreamFilter::Any, _) => true,
            (_, None) => true,
            (StreamFilter::Tag(name), Some(tag)) => name == tag,
            (StreamFilter::Untagged, Some(_)) => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub id: Option<String>,
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            id: None,
            timeout: Some(timeout),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub default_timeout: Duration,
    /// Label used in log lines (e.g. the worker name).
    pub label: String,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_CALL_TIMEOUT,
            label: "channel".to_string(),
        }
    }
}

struct PendingCall {
    operation: String,
    created_at: Instant,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

struct Subscriber {
    filter: StreamFilter,
    tx: mpsc::UnboundedSender<Frame>,
}

struct Shared {
    label: String,
    default_timeout: Duration,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<String, PendingCall>>,
    subscribers: Mutex<Vec<Subscriber>>,
    operations: Mutex<HashMap<String, OperationHandler>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct RpcChannel {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn new_call_id() -> String {
    nanoid!(16, &ID_ALPHABET)
}

impl RpcChannel {
    /// Start a channel over a reader/writer pair (e.g. a child's stdout and
    /// stdin). Must be called from within a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W, options: ChannelOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(reader, writer, options, Vec::new())
    }

    /// Like [`RpcChannel::spawn`], with a subscription that is in place
    /// before the first inbound frame is read.
    pub fn spawn_subscribed<R, W>(
        reader: R,
        writer: W,
        options: ChannelOptions,
        filter: StreamFilter,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self::start(reader, writer, options, vec![Subscriber { filter, tx }]);
        (channel, rx)
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        options: ChannelOptions,
        subscribers: Vec<Subscriber>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            label: options.label,
            default_timeout: options.default_timeout,
            outbound,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(subscribers),
            operations: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            closed_tx,
        });

        tokio::spawn(write_loop(Arc::clone(&shared), writer, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(&shared), reader));

        Self { shared }
    }

    pub fn from_stream<S>(stream: S, options: ChannelOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::spawn(reader, writer, options)
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Issue a call and wait for its correlated response.
    ///
    /// Exactly one outcome is delivered: the response, a timeout, or
    /// `Closed` when the channel goes away first.
    pub async fn call(
        &self,
        operation: &str,
        data: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let id = options.id.unwrap_or_else(new_call_id);
        let timeout = options.timeout.unwrap_or(self.shared.default_timeout);
        let (tx, mut rx) = oneshot::channel();

        {
            let mut pending = lock(&self.shared.pending);
            if pending.contains_key(&id) {
                return Err(RpcError::DuplicateId(id));
            }
            pending.insert(
                id.clone(),
                PendingCall {
                    operation: operation.to_string(),
                    created_at: Instant::now(),
                    tx,
                },
            );
        }

        // shutdown flips the flag before draining, so a call inserted after
        // the drain is caught here.
        if self.is_closed() {
            self.take_pending(&id);
            return Err(RpcError::Closed);
        }

        let frame = Frame::control(WireMessage::Custom(CustomEvent::RpcInvoke(RpcInvoke {
            name: operation.to_string(),
            id: id.clone(),
            data,
        })));
        if !self.shared.send_frame(frame) {
            self.take_pending(&id);
            return Err(RpcError::Closed);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                if self.take_pending(&id).is_some() {
                    tracing::debug!(
                        "[{}] rpc '{}' ({}) timed out after {}ms",
                        self.shared.label,
                        operation,
                        id,
                        timeout.as_millis()
                    );
                    Err(RpcError::Timeout {
                        operation: operation.to_string(),
                        id,
                        after_ms: timeout.as_millis() as u64,
                    })
                } else {
                    // Whoever removed the entry completed it under the same
                    // lock, so the value is already waiting.
                    (&mut rx).await.unwrap_or(Err(RpcError::Closed))
                }
            }
        }
    }

    /// Answer a call received from the other side.
    pub fn respond(&self, id: &str, result: Result<Value, String>) -> Result<(), RpcError> {
        let response = match result {
            Ok(data) => RpcResponse::ok(id, data),
            Err(message) => RpcResponse::err(id, message),
        };
        let frame = Frame::control(WireMessage::Custom(CustomEvent::RpcResponse(response)));
        if self.shared.send_frame(frame) {
            Ok(())
        } else {
            Err(RpcError::Closed)
        }
    }

    /// Send a data frame, optionally tagged with a logical stream.
    pub fn send(&self, message: WireMessage, stream_tag: Option<String>) -> Result<(), RpcError> {
        self.send_frame(Frame::data(message, stream_tag))
    }

    /// Send a control frame (`env-register`, `listen-address`,
    /// `full-reload`), optionally tagged with a logical stream.
    pub fn send_control(
        &self,
        message: WireMessage,
        stream_tag: Option<String>,
    ) -> Result<(), RpcError> {
        self.send_frame(Frame::tagged_control(message, stream_tag))
    }

    fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        if self.shared.send_frame(frame) {
            Ok(())
        } else {
            Err(RpcError::Closed)
        }
    }

    pub fn subscribe(&self, filter: StreamFilter) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            lock(&self.shared.subscribers).push(Subscriber { filter, tx });
        }
        rx
    }

    pub fn register_operation<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: OperationHandler = Arc::new(move |data| handler(data).boxed());
        lock(&self.shared.operations).insert(name.to_string(), handler);
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.shared.pending).contains_key(id)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.shared.shutdown();
    }

    /// Resolves once the channel has closed for any reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn take_pending(&self, id: &str) -> Option<PendingCall> {
        lock(&self.shared.pending).remove(id)
    }
}

impl Shared {
    fn send_frame(&self, frame: Frame) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        let Frame {
            kind,
            stream_tag,
            payload,
        } = frame;
        match payload {
            WireMessage::Custom(CustomEvent::RpcResponse(response)) => self.resolve(response),
            WireMessage::Custom(CustomEvent::RpcInvoke(invoke)) => self.invoke(invoke),
            payload => self.deliver(Frame {
                kind,
                stream_tag,
                payload,
            }),
        }
    }

    fn resolve(&self, response: RpcResponse) {
        let mut pending = lock(&self.pending);
        match pending.remove(&response.id) {
            Some(call) => {
                tracing::trace!(
                    "[{}] rpc '{}' ({}) settled in {}ms",
                    self.label,
                    call.operation,
                    response.id,
                    call.created_at.elapsed().as_millis()
                );
                let _ = call.tx.send(response.into_result().map_err(RpcError::Remote));
            }
            None => {
                tracing::debug!(
                    "[{}] dropping response for unknown or expired call {}",
                    self.label,
                    response.id
                );
            }
        }
    }

    fn invoke(self: &Arc<Self>, invoke: RpcInvoke) {
        let handler = lock(&self.operations).get(&invoke.name).cloned();
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let RpcInvoke { name, id, data } = invoke;
            let result = match handler {
                Some(handler) => match AssertUnwindSafe(handler(data)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(format!("rpc operation '{}' panicked", name)),
                },
                None => Err(RpcError::UnknownOperation(name).to_string()),
            };
            let response = match result {
                Ok(data) => RpcResponse::ok(id, data),
                Err(message) => RpcResponse::err(id, message),
            };
            shared.send_frame(Frame::control(WireMessage::Custom(CustomEvent::RpcResponse(
                response,
            ))));
        });
    }

    fn deliver(&self, frame: Frame) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|subscriber| {
            if !subscriber.filter.accepts(frame.tag()) {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(frame.clone()).is_ok()
        });
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed_tx.send_replace(true);

        let drained: Vec<(String, PendingCall)> = {
            let mut pending = lock(&self.pending);
            pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(
                "[{}] channel closed with {} pending call(s)",
                self.label,
                drained.len()
            );
        }
        for (_, call) in drained {
            let _ = call.tx.send(Err(RpcError::Closed));
        }
        lock(&self.subscribers).clear();
    }
}

async fn read_loop<R>(shared: Arc<Shared>, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let mut closed_rx = shared.closed_tx.subscribe();
    loop {
        if *closed_rx.borrow_and_update() {
            break;
        }
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = closed_rx.changed() => continue,
        };
        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Frame::decode(&line) {
                    Ok(frame) => shared.dispatch(frame),
                    Err(err) => {
                        tracing::warn!("[{}] dropping malformed frame: {}", shared.label, err)
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("[{}] channel read failed: {}", shared.label, err);
                break;
            }
        }
    }
    shared.shutdown();
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: W, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut closed_rx = shared.closed_tx.subscribe();
    loop {
        if *closed_rx.borrow_and_update() {
            break;
        }
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = closed_rx.changed() => continue,
        };
        let Some(frame) = frame else {
            break;
        };
        let mut line = match frame.encode() {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(
                    "[{}] {}",
                    shared.label,
                    RpcError::Encode(err.to_string())
                );
                continue;
            }
        };
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            tracing::warn!("[{}] channel write failed: {}", shared.label, err);
            break;
        }
    }
    shared.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FrameKind;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn pair() -> (RpcChannel, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        (RpcChannel::from_stream(ours, ChannelOptions::default()), theirs)
    }

    fn linked() -> (RpcChannel, RpcChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            RpcChannel::from_stream(a, ChannelOptions::default()),
            RpcChannel::from_stream(b, ChannelOptions::default()),
        )
    }

    async fn write_frame(stream: &mut tokio::io::WriteHalf<DuplexStream>, frame: Frame) {
        let mut line = frame.encode().unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    fn response(id: &str, data: Value) -> Frame {
        Frame::control(WireMessage::Custom(CustomEvent::RpcResponse(RpcResponse::ok(
            id, data,
        ))))
    }

    #[tokio::test]
    async fn out_of_order_responses_resolve_by_id() {
        let (channel, raw) = pair();
        let (read, mut write) = tokio::io::split(raw);
        let mut lines = BufReader::new(read).lines();

        let a = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .call("lookup", json!("a"), CallOptions::default().with_id("A"))
                    .await
            })
        };
        let first = Frame::decode(&lines.next_line().await.unwrap().unwrap()).unwrap();

        let b = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .call("lookup", json!("b"), CallOptions::default().with_id("B"))
                    .await
            })
        };
        let second = Frame::decode(&lines.next_line().await.unwrap().unwrap()).unwrap();

        assert_eq!(first.kind, FrameKind::Control);
        for frame in [&first, &second] {
            assert!(matches!(
                frame.payload,
                WireMessage::Custom(CustomEvent::RpcInvoke(_))
            ));
        }

        write_frame(&mut write, response("B", json!("for-b"))).await;
        write_frame(&mut write, response("A", json!("for-a"))).await;

        assert_eq!(b.await.unwrap(), Ok(json!("for-b")));
        assert_eq!(a.await.unwrap(), Ok(json!("for-a")));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn call_times_out_and_forgets_id() {
        let (channel, _raw) = pair();
        let started = Instant::now();
        let result = channel
            .call(
                "never",
                Value::Null,
                CallOptions::timeout(Duration::from_millis(100)).with_id("slow"),
            )
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(RpcError::Timeout { ref id, .. }) if id == "slow"));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert!(!channel.is_pending("slow"));
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_dropped() {
        let (channel, raw) = pair();
        let (_read, mut write) = tokio::io::split(raw);

        let result = channel
            .call(
                "slow",
                Value::Null,
                CallOptions::timeout(Duration::from_millis(20)).with_id("late"),
            )
            .await;
        assert!(result.unwrap_err().is_timeout());

        write_frame(&mut write, response("late", json!(1))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.pending_count(), 0);
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn stale_reply_never_resolves_a_later_call() {
        let (channel, raw) = pair();
        let (_read, mut write) = tokio::io::split(raw);

        let timed_out = channel
            .call(
                "slow",
                Value::Null,
                CallOptions::timeout(Duration::from_millis(20)).with_id("first"),
            )
            .await;
        assert!(matches!(timed_out, Err(RpcError::Timeout { ref id, .. }) if id == "first"));

        let next = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .call("again", Value::Null, CallOptions::default().with_id("second"))
                    .await
            })
        };
        while !channel.is_pending("second") {
            tokio::task::yield_now().await;
        }

        write_frame(&mut write, response("first", json!("stale"))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(channel.is_pending("second"));
        assert_eq!(channel.pending_count(), 1);

        write_frame(&mut write, response("second", json!("fresh"))).await;
        assert_eq!(next.await.unwrap(), Ok(json!("fresh")));
        assert_eq!(channel.pending_count(), 0);
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn control_messages_are_written_as_control_frames() {
        let (channel, raw) = pair();
        let (read, _write) = tokio::io::split(raw);
        let mut lines = BufReader::new(read).lines();

        channel
            .send_control(
                WireMessage::listen_address(crate::WorkerAddress::tcp("127.0.0.1", 4100)),
                Some("api".into()),
            )
            .unwrap();
        channel.send_control(WireMessage::FullReload, None).unwrap();
        channel
            .send_control(WireMessage::env_register("api", "text:ok"), None)
            .unwrap();

        let address = lines.next_line().await.unwrap().unwrap();
        assert!(address.starts_with(r#"{"type":"control","streamTag":"api""#));
        assert!(address.contains(r#""event":"listen-address""#));
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"{"type":"control","payload":{"type":"full-reload"}}"#
        );
        let register = Frame::decode(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(register.kind, FrameKind::Control);
        assert_eq!(register.tag(), None);
    }

    #[tokio::test]
    async fn spawn_subscribed_sees_frames_sent_before_spawn() {
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let early = Frame::control(WireMessage::listen_address(crate::WorkerAddress::tcp(
            "127.0.0.1",
            4200,
        )));
        let mut line = early.encode().unwrap();
        line.push('\n');
        theirs.write_all(line.as_bytes()).await.unwrap();
        theirs.flush().await.unwrap();

        let (read, write) = tokio::io::split(ours);
        let (channel, mut frames) =
            RpcChannel::spawn_subscribed(read, write, ChannelOptions::default(), StreamFilter::Any);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(frames.recv().await.unwrap(), early);
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn closing_rejects_every_pending_call() {
        let (channel, raw) = pair();
        let first = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("one", Value::Null, CallOptions::default()).await })
        };
        let second = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("two", Value::Null, CallOptions::default()).await })
        };
        while channel.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        drop(raw);

        assert_eq!(first.await.unwrap(), Err(RpcError::Closed));
        assert_eq!(second.await.unwrap(), Err(RpcError::Closed));
        channel.closed().await;
        assert_eq!(
            channel.call("after", Value::Null, CallOptions::default()).await,
            Err(RpcError::Closed)
        );
    }

    #[tokio::test]
    async fn registered_operations_answer_calls() {
        let (host, worker) = linked();
        worker.register_operation("echo", |data| async move { Ok(json!({"echo": data})) });
        worker.register_operation("fail", |_| async move { Err("nope".to_string()) });

        let echoed = host.call("echo", json!(7), CallOptions::default()).await;
        assert_eq!(echoed, Ok(json!({"echo": 7})));

        let failed = host.call("fail", Value::Null, CallOptions::default()).await;
        assert_eq!(failed, Err(RpcError::Remote("nope".to_string())));

        let missing = host.call("missing", Value::Null, CallOptions::default()).await;
        assert_eq!(
            missing,
            Err(RpcError::Remote("unknown rpc operation: missing".to_string()))
        );
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let (channel, _raw) = pair();
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .call(
                        "first",
                        Value::Null,
                        CallOptions::timeout(Duration::from_millis(200)).with_id("dup"),
                    )
                    .await
            })
        };
        while !channel.is_pending("dup") {
            tokio::task::yield_now().await;
        }
        let second = channel
            .call("second", Value::Null, CallOptions::default().with_id("dup"))
            .await;
        assert_eq!(second, Err(RpcError::DuplicateId("dup".to_string())));
        assert!(pending.await.unwrap().unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn tagged_frames_reach_only_matching_subscribers() {
        let (host, worker) = linked();
        let mut api = worker.subscribe(StreamFilter::Tag("api".into()));
        let mut ssr = worker.subscribe(StreamFilter::Tag("ssr".into()));
        let mut untagged = worker.subscribe(StreamFilter::Untagged);
        let mut any = worker.subscribe(StreamFilter::Any);

        host.send_control(WireMessage::FullReload, Some("api".into()))
            .unwrap();
        host.send_control(WireMessage::env_register("ssr", "static:."), None)
            .unwrap();

        let first = api.recv().await.unwrap();
        assert_eq!(first.tag(), Some("api"));
        let second = api.recv().await.unwrap();
        assert_eq!(second.tag(), None);

        let only = ssr.recv().await.unwrap();
        assert_eq!(only.tag(), None);
        assert!(matches!(
            only.payload,
            WireMessage::Custom(CustomEvent::EnvRegister(_))
        ));

        let broadcast = untagged.recv().await.unwrap();
        assert_eq!(broadcast.tag(), None);

        assert_eq!(any.recv().await.unwrap().tag(), Some("api"));
        assert_eq!(any.recv().await.unwrap().tag(), None);

        assert!(ssr.try_recv().is_err());
        assert!(untagged.try_recv().is_err());
    }

    #[test]
    fn filter_rules() {
        let api = StreamFilter::Tag("api".into());
        assert!(api.accepts(Some("api")));
        assert!(api.accepts(None));
        assert!(!api.accepts(Some("ssr")));
        assert!(!StreamFilter::Untagged.accepts(Some("api")));
        assert!(StreamFilter::Any.accepts(Some("ssr")));
    }

    #[test]
    fn call_ids_are_unique() {
        let a = new_call_id();
        let b = new_call_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
