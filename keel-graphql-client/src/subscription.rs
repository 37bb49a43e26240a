//! Subscription management over a shared duplex connection.
//!
//! Every subscription, whichever API started it, runs on one driver task:
//! acquire the shared connection, start the operation, forward events, and on
//! a transport failure retire the connection and reconnect with backoff until
//! the retry budget runs out. Delivery and cancellation go through a
//! per-record re-entrant gate, so once [`SubscriptionHandle::unsubscribe`]
//! returns no further callback runs for that subscription.

use futures::{Stream, StreamExt};
use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::operation::OperationKey;
use crate::request::GraphQLRequest;
use crate::retry::Backoff;
use crate::transport::{DuplexConnection, DuplexTransport};
use crate::{GraphQLClientConfig, GraphQLError, Result};

/// Lifecycle of the shared duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been opened yet.
    Disconnected,
    /// A handshake is in progress.
    Connecting,
    /// The connection is open.
    Connected,
    /// The connection was closed by the peer.
    Closed,
    /// The last connection failed or was retired after an error.
    Erroring,
    /// The manager was disposed.
    Disposed,
}

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    /// Created, driver not started.
    Idle,
    /// Waiting for the shared connection.
    Connecting,
    /// Operation started; events are flowing.
    Streaming,
    /// Waiting out a reconnect backoff.
    Retrying,
    /// Cancelled, completed or failed. Terminal.
    Closed,
}

pub(crate) enum Delivery {
    Data(Value),
    Error(GraphQLError),
    Complete,
}

type Sink = Box<dyn FnMut(Delivery) + Send>;

/// Callbacks for a long-lived subscription.
pub struct SubscriptionHandlers<T> {
    on_data: Box<dyn FnMut(T) + Send>,
    on_error: Box<dyn FnMut(GraphQLError) + Send>,
    on_complete: Option<Box<dyn FnMut() + Send>>,
}

impl<T: DeserializeOwned + 'static> SubscriptionHandlers<T> {
    /// Handlers for data and errors. Payloads that do not decode as `T`
    /// are reported through `on_error`.
    pub fn new(
        on_data: impl FnMut(T) + Send + 'static,
        on_error: impl FnMut(GraphQLError) + Send + 'static,
    ) -> Self {
        Self {
            on_data: Box::new(on_data),
            on_error: Box::new(on_error),
            on_complete: None,
        }
    }

    /// Called once when the server completes the subscription.
    pub fn on_complete(mut self, on_complete: impl FnMut() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }

    fn into_sink(mut self) -> Sink {
        Box::new(move |delivery| match delivery {
            Delivery::Data(value) => match serde_json::from_value::<T>(value) {
                Ok(data) => (self.on_data)(data),
                Err(e) => (self.on_error)(e.into()),
            },
            Delivery::Error(e) => (self.on_error)(e),
            Delivery::Complete => {
                if let Some(on_complete) = self.on_complete.as_mut() {
                    on_complete();
                }
            }
        })
    }
}

#[derive(Debug, Default)]
struct RetryState {
    count: u32,
    last_retry_at: Option<Instant>,
}

enum RetryDecision {
    Retry { count: u32 },
    GiveUp { count: u32 },
}

/// Tracking record for one subscription.
struct Record {
    id: u64,
    key: OperationKey,
    tracked: bool,
    active: AtomicBool,
    gate: ReentrantMutex<()>,
    wake: Notify,
    retry: Mutex<RetryState>,
    phase: Mutex<SubscriptionPhase>,
}

impl Record {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: SubscriptionPhase) {
        *self.phase.lock() = phase;
    }

    fn reset_retries(&self) {
        self.retry.lock().count = 0;
    }

    /// Count a transport failure and decide whether to reconnect.
    fn register_failure(&self, max_retries: u32, min_interval: Duration) -> RetryDecision {
        let now = Instant::now();
        let mut retry = self.retry.lock();
        retry.count += 1;

        let debounced = retry
            .last_retry_at
            .is_none_or(|at| now.duration_since(at) > min_interval);

        if retry.count <= max_retries && debounced {
            retry.last_retry_at = Some(now);
            RetryDecision::Retry { count: retry.count }
        } else {
            RetryDecision::GiveUp { count: retry.count }
        }
    }

    /// Run `sink` under the gate if the record is still active.
    fn deliver(&self, sink: &mut Sink, delivery: Delivery) {
        let _gate = self.gate.lock();
        if self.is_active() {
            sink(delivery);
        }
    }

    /// Deliver a final event, then deactivate.
    fn finish(&self, sink: &mut Sink, delivery: Option<Delivery>) {
        let _gate = self.gate.lock();
        if self.active.swap(false, Ordering::SeqCst)
            && let Some(delivery) = delivery
        {
            sink(delivery);
        }
        self.set_phase(SubscriptionPhase::Closed);
    }

    fn cancel(&self) -> bool {
        let _gate = self.gate.lock();
        let was_active = self.active.swap(false, Ordering::SeqCst);
        if was_active {
            self.wake.notify_one();
        }
        self.set_phase(SubscriptionPhase::Closed);
        was_active
    }
}

/// Cancels a subscription.
///
/// Dropping a handle does not unsubscribe.
#[derive(Clone, Default)]
pub struct SubscriptionHandle {
    record: Option<Arc<Record>>,
    manager: Weak<Inner>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.is_active())
            .field("phase", &self.phase())
            .finish()
    }
}

impl SubscriptionHandle {
    fn noop() -> Self {
        Self::default()
    }

    /// Stop the subscription. Safe to call from inside a handler and more
    /// than once.
    pub fn unsubscribe(&self) {
        let Some(record) = &self.record else {
            return;
        };
        if record.cancel() {
            debug!(key = %record.key, "Subscription cancelled");
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.untrack(record);
        }
    }

    /// Whether the subscription may still deliver events.
    pub fn is_active(&self) -> bool {
        self.record.as_ref().is_some_and(|r| r.is_active())
    }

    /// Current lifecycle phase. A no-op handle reports `Closed`.
    pub fn phase(&self) -> SubscriptionPhase {
        self.record
            .as_ref()
            .map_or(SubscriptionPhase::Closed, |r| *r.phase.lock())
    }

    /// Consecutive transport failures since the last delivered message.
    pub fn retry_count(&self) -> u32 {
        self.record.as_ref().map_or(0, |r| r.retry.lock().count)
    }
}

/// Stream of subscription results. Dropping it unsubscribes.
pub struct SubscriptionStream<T = Value> {
    rx: mpsc::UnboundedReceiver<Result<Value>>,
    handle: SubscriptionHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SubscriptionStream<T> {
    /// Handle controlling the underlying subscription.
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl<T: DeserializeOwned> Stream for SubscriptionStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|item| {
            item.map(|result| {
                result.and_then(|value| serde_json::from_value(value).map_err(Into::into))
            })
        })
    }
}

impl<T> Drop for SubscriptionStream<T> {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

struct ConnectionSlot {
    state: ConnectionState,
    current: Option<(u64, Arc<dyn DuplexConnection>)>,
    generation: u64,
    reconnect_attempts: u32,
}

struct Inner {
    transport: Arc<dyn DuplexTransport>,
    url: String,
    connection_params: Option<Value>,
    max_retries: u32,
    backoff: Backoff,
    min_retry_interval: Duration,
    lifecycle: tokio::sync::Mutex<()>,
    slot: Mutex<ConnectionSlot>,
    tracked: Mutex<HashMap<OperationKey, Arc<Record>>>,
    detached: Mutex<HashMap<u64, Arc<Record>>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl Inner {
    /// Return the shared connection, opening one if needed.
    ///
    /// `starting` marks the first acquisition of a new subscription, which
    /// resets an exhausted reconnect counter.
    async fn acquire(&self, starting: bool) -> Result<(u64, Arc<dyn DuplexConnection>)> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut slot = self.slot.lock();
            if self.disposed.load(Ordering::SeqCst) {
                return Err(GraphQLError::Disposed);
            }
            if starting && slot.reconnect_attempts >= self.max_retries {
                debug!(attempts = slot.reconnect_attempts, "Resetting exhausted reconnect counter");
                slot.reconnect_attempts = 0;
            }
            if let Some((generation, connection)) = &slot.current
                && connection.is_open()
            {
                return Ok((*generation, Arc::clone(connection)));
            }
            slot.current = None;
            slot.state = ConnectionState::Connecting;
        }

        debug!(url = %self.url, "Opening duplex connection");
        let connected = self
            .transport
            .connect(&self.url, self.connection_params.clone())
            .await;

        let mut slot = self.slot.lock();
        match connected {
            Ok(connection) => {
                if self.disposed.load(Ordering::SeqCst) {
                    connection.close();
                    return Err(GraphQLError::Disposed);
                }
                slot.generation += 1;
                slot.current = Some((slot.generation, Arc::clone(&connection)));
                slot.reconnect_attempts = 0;
                slot.state = ConnectionState::Connected;
                info!(
                    url = %self.url,
                    generation = slot.generation,
                    "Duplex connection established"
                );
                Ok((slot.generation, connection))
            }
            Err(e) => {
                slot.reconnect_attempts += 1;
                slot.state = ConnectionState::Erroring;
                warn!(
                    url = %self.url,
                    attempts = slot.reconnect_attempts,
                    error = %e,
                    "Duplex connection failed"
                );
                Err(e)
            }
        }
    }

    /// Tear down connection `generation` if it is still the current one.
    fn retire(&self, generation: u64) {
        let mut slot = self.slot.lock();
        let is_current = slot
            .current
            .as_ref()
            .is_some_and(|(current, _)| *current == generation);
        if !is_current {
            return;
        }
        if let Some((_, connection)) = slot.current.take() {
            connection.close();
        }
        slot.reconnect_attempts += 1;
        slot.state = ConnectionState::Erroring;
        debug!(generation, "Retired duplex connection");
    }

    fn untrack(&self, record: &Arc<Record>) {
        if record.tracked {
            let mut tracked = self.tracked.lock();
            if tracked
                .get(&record.key)
                .is_some_and(|existing| Arc::ptr_eq(existing, record))
            {
                tracked.remove(&record.key);
            }
        } else {
            self.detached.lock().remove(&record.id);
        }
    }
}

/// Multiplexes subscriptions over one lazily created duplex connection.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("url", &self.inner.url)
            .field("state", &self.connection_state())
            .field("active", &self.active_subscriptions())
            .finish()
    }
}

impl SubscriptionManager {
    /// Create a manager for `url`. No connection is opened until the first
    /// subscription.
    pub fn new(
        transport: Arc<dyn DuplexTransport>,
        url: impl Into<String>,
        config: &GraphQLClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                url: url.into(),
                connection_params: config.connection_params.clone(),
                max_retries: config.max_ws_retries,
                backoff: config.ws_retry_backoff,
                min_retry_interval: config.min_retry_interval,
                lifecycle: tokio::sync::Mutex::new(()),
                slot: Mutex::new(ConnectionSlot {
                    state: ConnectionState::Disconnected,
                    current: None,
                    generation: 0,
                    reconnect_attempts: 0,
                }),
                tracked: Mutex::new(HashMap::new()),
                detached: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    fn new_record(&self, request: &GraphQLRequest, tracked: bool) -> Arc<Record> {
        Arc::new(Record {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            key: OperationKey::new(&request.query, request.variables.as_ref()),
            tracked,
            active: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
            wake: Notify::new(),
            retry: Mutex::new(RetryState::default()),
            phase: Mutex::new(SubscriptionPhase::Idle),
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(GraphQLError::Disposed)
        } else {
            Ok(())
        }
    }

    fn handle_for(&self, record: &Arc<Record>) -> SubscriptionHandle {
        SubscriptionHandle {
            record: Some(Arc::clone(record)),
            manager: Arc::downgrade(&self.inner),
        }
    }

    fn start_detached(
        &self,
        request: GraphQLRequest,
        sink: Sink,
        resilient: bool,
    ) -> SubscriptionHandle {
        let record = self.new_record(&request, false);
        self.inner.detached.lock().insert(record.id, Arc::clone(&record));
        tokio::spawn(drive(Arc::clone(&self.inner), Arc::clone(&record), request, sink, resilient));
        self.handle_for(&record)
    }

    /// Long-lived subscription delivering through `handlers`.
    ///
    /// At most one callback subscription per operation key: while one is
    /// active, another call for the same operation and variables returns a
    /// handle that does nothing.
    pub fn subscribe_with_callback<T>(
        &self,
        request: GraphQLRequest,
        handlers: SubscriptionHandlers<T>,
    ) -> Result<SubscriptionHandle>
    where
        T: DeserializeOwned + 'static,
    {
        self.ensure_live()?;

        let record = self.new_record(&request, true);
        {
            let mut tracked = self.inner.tracked.lock();
            if let Some(existing) = tracked.get(&record.key)
                && existing.is_active()
            {
                debug!(key = %record.key, "Subscription already active");
                return Ok(SubscriptionHandle::noop());
            }
            tracked.insert(record.key.clone(), Arc::clone(&record));
        }

        tokio::spawn(drive(
            Arc::clone(&self.inner),
            Arc::clone(&record),
            request,
            handlers.into_sink(),
            true,
        ));
        Ok(self.handle_for(&record))
    }

    /// Resolve with the first message.
    ///
    /// The operation stays open until the handle is used to unsubscribe;
    /// later messages are discarded. The first error rejects without
    /// reconnecting.
    pub async fn subscribe<T>(&self, request: GraphQLRequest) -> Result<(T, SubscriptionHandle)>
    where
        T: DeserializeOwned,
    {
        self.ensure_live()?;

        let (tx, rx) = oneshot::channel::<Result<Value>>();
        let mut first = Some(tx);
        let sink: Sink = Box::new(move |delivery| {
            let outcome = match delivery {
                Delivery::Data(value) => Ok(value),
                Delivery::Error(e) => Err(e),
                Delivery::Complete => Err(GraphQLError::EmptyResponse),
            };
            if let Some(tx) = first.take() {
                let _ = tx.send(outcome);
            }
        });

        let handle = self.start_detached(request, sink, false);
        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(GraphQLError::Disposed),
        };

        match outcome.and_then(|value| serde_json::from_value(value).map_err(Into::into)) {
            Ok(data) => Ok((data, handle)),
            Err(e) => {
                handle.unsubscribe();
                Err(e)
            }
        }
    }

    /// Stream every message, reconnecting on transport failures like a
    /// callback subscription.
    pub fn subscribe_stream<T>(&self, request: GraphQLRequest) -> Result<SubscriptionStream<T>> {
        self.ensure_live()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let sink: Sink = Box::new(move |delivery| match delivery {
            Delivery::Data(value) => {
                let _ = tx.send(Ok(value));
            }
            Delivery::Error(e) => {
                let _ = tx.send(Err(e));
            }
            Delivery::Complete => {}
        });

        let handle = self.start_detached(request, sink, true);
        Ok(SubscriptionStream {
            rx,
            handle,
            _marker: PhantomData,
        })
    }

    /// Close the connection and cancel every subscription.
    ///
    /// Later subscribe calls fail with [`GraphQLError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut records: Vec<Arc<Record>> =
            self.inner.tracked.lock().drain().map(|(_, r)| r).collect();
        records.extend(self.inner.detached.lock().drain().map(|(_, r)| r));
        for record in &records {
            record.cancel();
        }

        let mut slot = self.inner.slot.lock();
        if let Some((_, connection)) = slot.current.take() {
            connection.close();
        }
        slot.state = ConnectionState::Disposed;
        info!(cancelled = records.len(), "Subscription manager disposed");
    }

    /// Whether the shared connection is open, and the reconnect attempts
    /// since it last connected.
    pub fn connection_status(&self) -> (bool, u32) {
        let slot = self.inner.slot.lock();
        let open = slot
            .current
            .as_ref()
            .is_some_and(|(_, connection)| connection.is_open());
        (open, slot.reconnect_attempts)
    }

    /// Current connection lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        let slot = self.inner.slot.lock();
        match (&slot.current, slot.state) {
            (Some((_, connection)), ConnectionState::Connected) if !connection.is_open() => {
                ConnectionState::Closed
            }
            (_, state) => state,
        }
    }

    /// Number of live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        let tracked = self.inner.tracked.lock().values().filter(|r| r.is_active()).count();
        let detached = self.inner.detached.lock().values().filter(|r| r.is_active()).count();
        tracked + detached
    }
}

enum StreamEnd {
    Cancelled,
    Finished,
    Failed(GraphQLError),
}

async fn drive(
    inner: Arc<Inner>,
    record: Arc<Record>,
    request: GraphQLRequest,
    mut sink: Sink,
    resilient: bool,
) {
    let mut starting = true;

    loop {
        if !record.is_active() {
            break;
        }
        record.set_phase(SubscriptionPhase::Connecting);

        let end = match inner.acquire(starting).await {
            Ok((generation, connection)) => {
                if !record.is_active() {
                    break;
                }
                match connection.subscribe(request.clone()) {
                    Ok(stream) => {
                        record.set_phase(SubscriptionPhase::Streaming);
                        let end = pump(&record, &mut sink, stream).await;
                        if matches!(end, StreamEnd::Failed(ref e) if !e.is_graphql_error()) {
                            inner.retire(generation);
                        }
                        end
                    }
                    Err(e) => {
                        inner.retire(generation);
                        StreamEnd::Failed(e)
                    }
                }
            }
            Err(e) => StreamEnd::Failed(e),
        };
        starting = false;

        let failure = match end {
            StreamEnd::Cancelled => break,
            StreamEnd::Finished => {
                debug!(key = %record.key, "Subscription completed by server");
                record.finish(&mut sink, Some(Delivery::Complete));
                break;
            }
            StreamEnd::Failed(GraphQLError::Disposed) => {
                record.finish(&mut sink, None);
                break;
            }
            StreamEnd::Failed(e) if e.is_graphql_error() || !resilient => {
                record.finish(&mut sink, Some(Delivery::Error(e)));
                break;
            }
            StreamEnd::Failed(e) => e,
        };

        match record.register_failure(inner.max_retries, inner.min_retry_interval) {
            RetryDecision::Retry { count } => {
                let delay = inner.backoff.delay_for_attempt(count - 1);
                warn!(
                    key = %record.key,
                    retry_count = count,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Subscription transport failed, reconnecting"
                );
                record.set_phase(SubscriptionPhase::Retrying);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = record.wake.notified() => break,
                }
            }
            RetryDecision::GiveUp { count } => {
                error!(
                    key = %record.key,
                    retry_count = count,
                    error = %failure,
                    "Subscription failed permanently"
                );
                record.finish(
                    &mut sink,
                    Some(Delivery::Error(GraphQLError::Subscription {
                        message: failure.to_string(),
                        retry_count: count,
                    })),
                );
                break;
            }
        }
    }

    record.set_phase(SubscriptionPhase::Closed);
    inner.untrack(&record);
}

/// Forward events from one operation stream until it ends.
async fn pump(
    record: &Record,
    sink: &mut Sink,
    mut stream: crate::transport::OperationStream,
) -> StreamEnd {
    loop {
        let event = tokio::select! {
            _ = record.wake.notified() => return StreamEnd::Cancelled,
            event = stream.next() => event,
        };

        match event {
            Some(Ok(response)) => {
                record.reset_retries();
                let delivery = match response.into_result() {
                    Ok(data) => Delivery::Data(data),
                    Err(e) => Delivery::Error(e),
                };
                debug!(key = %record.key, "Subscription message");
                record.deliver(sink, delivery);
            }
            // an undecodable payload belongs to this operation, not the socket
            Some(Err(e @ GraphQLError::Json(_))) => {
                warn!(key = %record.key, error = %e, "Undecodable subscription payload");
                record.deliver(sink, Delivery::Error(e));
            }
            Some(Err(e)) => return StreamEnd::Failed(e),
            None => return StreamEnd::Finished,
        }

        if !record.is_active() {
            return StreamEnd::Cancelled;
        }
    }
}
