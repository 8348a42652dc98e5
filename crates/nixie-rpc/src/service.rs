//! The service runtime
//!
//! A [`Service`] binds one `(name, worker)` identity to a bus, runs the
//! dispatch loops for its own channel and the shared healthcheck channel,
//! and exposes the caller API. Handlers, the ping callback and the plain
//! message callback are registered before or after start; registration is
//! taken into account from the next message on.

use crate::call::{CallError, CallOptions, CallResult, Rejection, Reply, ReplyStream, WaiterTable};
use crate::error::{RpcError, RpcResult};
use crate::inbound::{InboundRequest, ResponsePublisher};
use crate::liveness::LivenessTracker;
use crate::registry::WorkerRegistry;
use anyhow::anyhow;
use async_trait::async_trait;
use nixie_bus::{Bus, BusMessage};
use nixie_core::config::RpcConfig;
use nixie_core::envelope::{
    self, Body, Envelope, Fields, LivenessMap, PingId, PlainMessage, RequestId, Response,
};
use nixie_core::identity::{ServiceIdentity, ServiceName, WorkerId, HEALTHCHECK_CHANNEL};
use nixie_core::io::IoContext;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Boxed async request handler
pub type RequestHandler =
    Arc<dyn Fn(InboundRequest) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Called after each adopted liveness snapshot; the flag is true when this
/// instance originated the round
pub type PingCallback = Arc<dyn Fn(bool, &LivenessMap) + Send + Sync>;

/// Called for each plain message received on the instance's own channel
pub type MessageCallback = Arc<dyn Fn(PlainMessage) + Send + Sync>;

struct ServiceInner {
    identity: ServiceIdentity,
    config: RpcConfig,
    bus: Arc<dyn Bus>,
    io: IoContext,
    handlers: RwLock<HashMap<String, RequestHandler>>,
    waiters: Arc<WaiterTable>,
    registry: Mutex<WorkerRegistry>,
    liveness: Mutex<LivenessTracker>,
    success: AtomicU64,
    errors: AtomicU64,
    ping_callback: RwLock<Option<PingCallback>>,
    message_callback: RwLock<Option<MessageCallback>>,
    shutdown: Notify,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServiceInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInner")
            .field("identity", &self.identity)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

/// Builder for [`Service`]
#[derive(Debug)]
pub struct ServiceBuilder {
    name: ServiceName,
    worker: WorkerId,
    bus: Arc<dyn Bus>,
    config: RpcConfig,
    io: IoContext,
}

impl ServiceBuilder {
    /// Override the timing configuration
    pub fn with_config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the I/O providers (for tests)
    pub fn with_io(mut self, io: IoContext) -> Self {
        self.io = io;
        self
    }

    /// Validate and build the service
    pub fn build(self) -> RpcResult<Service> {
        self.config.validate()?;

        let liveness = LivenessTracker::new(
            self.config.liveness_validity_ms(),
            self.config.pong_throttle_ms(),
        );

        Ok(Service {
            inner: Arc::new(ServiceInner {
                identity: ServiceIdentity::new(self.name, self.worker),
                config: self.config,
                bus: self.bus,
                io: self.io,
                handlers: RwLock::new(HashMap::new()),
                waiters: Arc::new(WaiterTable::new()),
                registry: Mutex::new(WorkerRegistry::new()),
                liveness: Mutex::new(liveness),
                success: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                ping_callback: RwLock::new(None),
                message_callback: RwLock::new(None),
                shutdown: Notify::new(),
                running: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// One running instance of a named service
#[derive(Debug, Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Start building a service bound to a bus
    pub fn builder(name: ServiceName, worker: WorkerId, bus: Arc<dyn Bus>) -> ServiceBuilder {
        ServiceBuilder {
            name,
            worker,
            bus,
            config: RpcConfig::default(),
            io: IoContext::production(),
        }
    }

    /// This instance's identity
    pub fn identity(&self) -> &ServiceIdentity {
        &self.inner.identity
    }

    /// Register a handler for a request type
    ///
    /// Replaces any previous handler for the same type.
    pub fn register_handler<F, Fut>(&self, request_type: impl Into<String>, handler: F)
    where
        F: Fn(InboundRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |req| Box::pin(handler(req)));
        self.inner
            .handlers
            .write()
            .insert(request_type.into(), handler);
    }

    /// Register the liveness snapshot callback
    pub fn on_ping<F>(&self, callback: F)
    where
        F: Fn(bool, &LivenessMap) + Send + Sync + 'static,
    {
        *self.inner.ping_callback.write() = Some(Arc::new(callback));
    }

    /// Register the plain message callback
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(PlainMessage) + Send + Sync + 'static,
    {
        *self.inner.message_callback.write() = Some(Arc::new(callback));
    }

    /// Subscribe and start the dispatch and ping loops
    pub async fn start(&self) -> RpcResult<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(RpcError::AlreadyStarted {
                service: inner.identity.to_string(),
            });
        }

        let own_rx = inner.bus.subscribe(&inner.identity.channel()).await?;
        let health_rx = inner.bus.subscribe(HEALTHCHECK_CHANNEL).await?;

        let mut tasks = inner.tasks.lock();
        tasks.push(tokio::spawn(dispatch_loop(
            inner.clone_arc(),
            own_rx,
            false,
        )));
        tasks.push(tokio::spawn(dispatch_loop(
            inner.clone_arc(),
            health_rx,
            true,
        )));
        tasks.push(tokio::spawn(ping_loop(inner.clone_arc())));
        drop(tasks);

        tracing::info!(identity = %inner.identity, "service started");
        Ok(())
    }

    /// Stop the loops and wait for them to finish
    ///
    /// Outstanding inbound handlers keep running to completion; outstanding
    /// outbound calls resolve with an internal error.
    pub async fn stop(&self) -> RpcResult<()> {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return Err(RpcError::NotStarted {
                service: inner.identity.to_string(),
            });
        }

        inner.shutdown.notify_waiters();

        let tasks = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        tracing::info!(identity = %inner.identity, "service stopped");
        Ok(())
    }

    /// Call a remote service with default options
    pub async fn request(
        &self,
        target: &ServiceName,
        request_type: &str,
        fields: Fields,
    ) -> CallResult<Reply> {
        self.request_opts(target, request_type, fields, CallOptions::new())
            .await
    }

    /// Call a remote service
    ///
    /// Picks a worker (round-robin, skipping ones the current liveness
    /// snapshot reports dead), publishes the request, and waits for the
    /// first response frame. Fails fast with [`CallError::Unavailable`] when
    /// a valid snapshot lists no matching live worker.
    pub async fn request_opts(
        &self,
        target: &ServiceName,
        request_type: &str,
        fields: Fields,
        options: CallOptions,
    ) -> CallResult<Reply> {
        let inner = &self.inner;

        let worker = match options.worker {
            Some(worker) => worker,
            None => inner.select_worker(target),
        };

        {
            let now = inner.io.now_ms();
            let liveness = inner.liveness.lock();
            if liveness.is_valid(now) && !liveness.contains(&format!("{}@{}", target, worker)) {
                return Err(CallError::Unavailable {
                    service: target.to_string(),
                    worker: options.worker,
                });
            }
        }

        let request_id = RequestId::new(inner.io.gen_uuid());
        let mut rx = inner.waiters.register(request_id.clone());

        let envelope = Envelope {
            source: inner.identity.name.clone(),
            worker: inner.identity.worker,
            body: Body::Request {
                request_type: request_type.to_string(),
                request_id: request_id.clone(),
                fields,
            },
        };

        if let Err(error) = inner
            .publish_envelope(&nixie_core::identity::channel_for(target, worker), &envelope)
            .await
        {
            inner.waiters.remove(&request_id);
            tracing::warn!(%target, %error, "request publish failed");
            return Err(CallError::Internal {
                service: target.to_string(),
            });
        }

        let timeout_ms = options.timeout_ms.unwrap_or(inner.config.request_timeout_ms);

        let first = tokio::select! {
            frame = rx.recv() => frame,
            _ = inner.io.sleep_ms(timeout_ms) => {
                inner.waiters.remove(&request_id);
                return Err(CallError::Timeout {
                    service: target.to_string(),
                    timeout_ms,
                });
            }
        };

        let Some(first) = first else {
            // Waiter table dropped the sender: service stopping.
            return Err(CallError::Internal {
                service: target.to_string(),
            });
        };

        match first {
            Response::Simple { content } => {
                inner.waiters.remove(&request_id);
                Ok(Reply::Simple(Some(content)))
            }
            Response::End => {
                inner.waiters.remove(&request_id);
                Ok(Reply::Simple(None))
            }
            Response::Stream => Ok(Reply::Stream(ReplyStream::new(
                target.to_string(),
                request_id,
                rx,
                inner.waiters.clone(),
            ))),
            Response::Reject {
                rejection_type,
                args,
                kwargs,
            } => {
                inner.waiters.remove(&request_id);
                Err(CallError::Rejected(Rejection {
                    kind: rejection_type,
                    args,
                    kwargs,
                }))
            }
            Response::Error => {
                inner.waiters.remove(&request_id);
                Err(CallError::Internal {
                    service: target.to_string(),
                })
            }
            // A content frame before the stream ack violates the protocol.
            Response::Content { .. } => {
                inner.waiters.remove(&request_id);
                tracing::warn!(%target, %request_id, "content frame before stream ack");
                Err(CallError::Internal {
                    service: target.to_string(),
                })
            }
        }
    }

    /// Publish a fire-and-forget plain message
    ///
    /// The worker is picked like a request's would be when not given. There
    /// is no availability check and no reply; a message to a dead worker is
    /// simply lost.
    pub async fn send(
        &self,
        target: &ServiceName,
        worker: Option<WorkerId>,
        kind: &str,
        fields: &Fields,
    ) -> RpcResult<()> {
        let inner = &self.inner;
        let worker = worker.unwrap_or_else(|| inner.select_worker(target));
        let raw = envelope::encode_plain(kind, &inner.identity.name, inner.identity.worker, fields)?;
        inner
            .bus
            .publish(&nixie_core::identity::channel_for(target, worker), raw)
            .await?;
        Ok(())
    }

    /// Number of outstanding outbound calls
    pub fn pending_calls(&self) -> usize {
        self.inner.waiters.len()
    }

    /// Requests handled successfully since the last liveness reply
    pub fn success_count(&self) -> u64 {
        self.inner.success.load(Ordering::SeqCst)
    }

    /// Handler faults since the last liveness reply
    pub fn error_count(&self) -> u64 {
        self.inner.errors.load(Ordering::SeqCst)
    }

    /// Copy of the adopted liveness snapshot
    pub fn liveness_snapshot(&self) -> LivenessMap {
        self.inner.liveness.lock().snapshot().clone()
    }

    /// Known workers of a service, in rotation order
    pub fn known_workers(&self, service: &ServiceName) -> Vec<WorkerId> {
        self.inner.registry.lock().workers_of(service).to_vec()
    }
}

impl ServiceInner {
    fn clone_arc(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    /// Round-robin pick, skipping workers the current snapshot reports dead
    ///
    /// Without a valid snapshot nothing is skipped; a never-observed target
    /// gets worker 0.
    fn select_worker(&self, target: &ServiceName) -> WorkerId {
        let now = self.io.now_ms();
        let liveness = self.liveness.lock();
        let valid = liveness.is_valid(now);
        let is_live = |w: WorkerId| liveness.contains(&format!("{}@{}", target, w));
        let filter: Option<&dyn Fn(WorkerId) -> bool> = if valid { Some(&is_live) } else { None };
        self.registry.lock().select(target, filter)
    }

    async fn publish_envelope(&self, channel: &str, envelope: &Envelope) -> RpcResult<()> {
        let raw = envelope::encode(envelope)?;
        self.bus.publish(channel, raw).await?;
        Ok(())
    }

    async fn publish_body(&self, channel: &str, body: Body) -> RpcResult<()> {
        let envelope = Envelope {
            source: self.identity.name.clone(),
            worker: self.identity.worker,
            body,
        };
        self.publish_envelope(channel, &envelope).await
    }

    /// Record workers named by a snapshot into the registry
    fn merge_registry(&self, map: &LivenessMap) {
        let mut registry = self.registry.lock();
        for key in map.keys() {
            match ServiceIdentity::parse_key(key) {
                Ok(id) => registry.observe(&id.name, id.worker),
                Err(error) => {
                    tracing::warn!(%key, %error, "malformed liveness key, skipped");
                }
            }
        }
    }

    fn fire_ping_callback(&self, originated: bool, map: &LivenessMap) {
        let callback = self.ping_callback.read().clone();
        if let Some(callback) = callback {
            callback(originated, map);
        }
    }

    /// Close a round and broadcast its result
    ///
    /// Runs on the last awaited pong and on the round timeout; the loser of
    /// that race finds the round already gone.
    async fn finish_round(self: &Arc<Self>, ping_id: &PingId) {
        let now = self.io.now_ms();
        let map = {
            let mut liveness = self.liveness.lock();
            match liveness.finalize_round(ping_id, now) {
                Some(map) => map,
                None => return,
            }
        };

        self.merge_registry(&map);
        self.fire_ping_callback(true, &map);

        tracing::debug!(%ping_id, workers = map.len(), "liveness round finished");

        if let Err(error) = self
            .publish_body(HEALTHCHECK_CHANNEL, Body::PingResult { pings: map })
            .await
        {
            tracing::warn!(%error, "ping-result publish failed");
        }
    }

    async fn handle_ping(self: &Arc<Self>, sender: &ServiceIdentity, ping_id: PingId) {
        let now = self.io.now_ms();
        self.liveness.lock().throttle(now);

        // Counters reset on every reply; the report covers the window since
        // the previous one.
        let success = self.success.swap(0, Ordering::SeqCst);
        let errors = self.errors.swap(0, Ordering::SeqCst);

        if let Err(error) = self
            .publish_body(
                &sender.channel(),
                Body::Pong {
                    ping_id,
                    success,
                    errors,
                },
            )
            .await
        {
            tracing::warn!(%error, "pong publish failed");
        }
    }

    async fn handle_pong(self: &Arc<Self>, sender: &ServiceIdentity, ping_id: PingId, success: u64, errors: u64) {
        let now = self.io.now_ms();
        let complete = self.liveness.lock().record_pong(
            &ping_id,
            &sender.key(),
            success,
            errors,
            now,
        );

        if complete {
            self.finish_round(&ping_id).await;
        }
    }

    fn handle_ping_result(self: &Arc<Self>, sender: &ServiceIdentity, map: LivenessMap) {
        // Our own broadcast comes back on the shared channel; we already
        // adopted it when the round finished.
        if *sender == self.identity {
            return;
        }

        let now = self.io.now_ms();
        self.liveness.lock().adopt(map.clone(), now);
        self.merge_registry(&map);
        self.fire_ping_callback(false, &map);
    }

    async fn run_handler(self: Arc<Self>, request: InboundRequest) {
        let handler = self.handlers.read().get(request.request_type()).cloned();

        let Some(handler) = handler else {
            tracing::warn!(
                request_type = request.request_type(),
                source = %request.source(),
                "no handler registered, ending request"
            );
            if let Err(error) = request.end().await {
                tracing::warn!(%error, "end publish failed");
            }
            return;
        };

        // The extra spawn turns a handler panic into a join error instead of
        // taking the dispatch task down.
        let result = match tokio::spawn(handler(request.clone())).await {
            Ok(result) => result,
            Err(join_error) => Err(anyhow!("handler panicked: {join_error}")),
        };

        match result {
            Ok(()) => {
                self.success.fetch_add(1, Ordering::SeqCst);
                if !request.is_finalized() && !request.is_streaming() {
                    if let Err(error) = request.end().await {
                        tracing::warn!(%error, "end publish failed");
                    }
                }
            }
            Err(error) => {
                self.errors.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    request_type = request.request_type(),
                    source = %request.source(),
                    %error,
                    "handler failed"
                );
                if let Err(error) = request.error().await {
                    tracing::warn!(%error, "error publish failed");
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, message: BusMessage, from_healthcheck: bool) {
        let incoming = match envelope::decode(&message.payload) {
            Ok(incoming) => incoming,
            Err(error) => {
                tracing::warn!(channel = %message.channel, %error, "undecodable message dropped");
                return;
            }
        };

        match incoming {
            envelope::Incoming::Rpc(envelope) => {
                let sender = envelope.sender();
                match envelope.body {
                    Body::Request {
                        request_type,
                        request_id,
                        fields,
                    } if !from_healthcheck => {
                        let request = InboundRequest::new(
                            self.clone_arc() as Arc<dyn ResponsePublisher>,
                            sender,
                            request_id,
                            request_type,
                            fields,
                        );
                        tokio::spawn(self.clone_arc().run_handler(request));
                    }
                    Body::Response {
                        request_id,
                        response,
                    } if !from_healthcheck => {
                        if !self.waiters.deliver(&request_id, response) {
                            tracing::debug!(%request_id, "late response frame dropped");
                        }
                    }
                    Body::Pong {
                        ping_id,
                        success,
                        errors,
                    } if !from_healthcheck => {
                        self.handle_pong(&sender, ping_id, success, errors).await;
                    }
                    Body::Ping { ping_id } if from_healthcheck => {
                        self.handle_ping(&sender, ping_id).await;
                    }
                    Body::PingResult { pings } if from_healthcheck => {
                        self.handle_ping_result(&sender, pings);
                    }
                    body => {
                        tracing::debug!(
                            channel = %message.channel,
                            ?body,
                            "rpc message on wrong channel, dropped"
                        );
                    }
                }
            }
            envelope::Incoming::Plain(plain) => {
                if from_healthcheck {
                    return;
                }
                let callback = self.message_callback.read().clone();
                match callback {
                    Some(callback) => callback(plain),
                    None => {
                        tracing::debug!(kind = %plain.kind, "plain message without callback dropped")
                    }
                }
            }
        }
    }

    async fn maybe_originate(self: &Arc<Self>) {
        let now = self.io.now_ms();
        let ping_id = {
            let mut liveness = self.liveness.lock();
            if !liveness.should_originate(now) {
                return;
            }
            let ping_id = PingId::new(self.io.gen_uuid());
            if !liveness.begin_round(ping_id.clone(), now) {
                return;
            }
            ping_id
        };

        tracing::debug!(%ping_id, "originating liveness round");

        if let Err(error) = self
            .publish_body(HEALTHCHECK_CHANNEL, Body::Ping { ping_id: ping_id.clone() })
            .await
        {
            tracing::warn!(%error, "ping publish failed");
        }

        // Timeout finalizer; a no-op when the last awaited pong already
        // closed the round.
        let inner = self.clone_arc();
        let timeout_ms = self.config.ping_timeout_ms;
        tokio::spawn(async move {
            inner.io.sleep_ms(timeout_ms).await;
            inner.finish_round(&ping_id).await;
        });
    }
}

#[async_trait]
impl ResponsePublisher for ServiceInner {
    async fn publish_response(
        &self,
        target: &ServiceIdentity,
        request_id: &RequestId,
        response: Response,
    ) -> RpcResult<()> {
        self.publish_body(
            &target.channel(),
            Body::Response {
                request_id: request_id.clone(),
                response,
            },
        )
        .await
    }
}

async fn dispatch_loop(
    inner: Arc<ServiceInner>,
    mut rx: mpsc::UnboundedReceiver<BusMessage>,
    from_healthcheck: bool,
) {
    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(message) => inner.handle_message(message, from_healthcheck).await,
                    None => break,
                }
            }
            _ = inner.shutdown.notified() => break,
        }
    }
}

async fn ping_loop(inner: Arc<ServiceInner>) {
    loop {
        tokio::select! {
            _ = inner.io.sleep_ms(inner.config.ping_delay_ms) => {
                inner.maybe_originate().await;
            }
            _ = inner.shutdown.notified() => break,
        }
    }
}
