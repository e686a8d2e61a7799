//! `ReplicaRuntime` — wires the `mio` receive loop, the bounded inbox,
//! the validation/execution worker pool, the dispatch thread, and the
//! timer thread around a [`PreProcessor`] (`spec.md` §5 "Scheduling
//! model", expanded in this crate's `SPEC_FULL.md` §4.4).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         quorate-replica                          │
//! │  ┌────────────┐   ┌───────────────────┐   ┌───────────────────┐  │
//! │  │ ReceiveLoop│ → │ IncomingMsgsStorage│ → │  dispatch thread  │  │
//! │  │ (mio poll) │   │  (ArrayQueue)      │   │  (→ PreProcessor) │  │
//! │  └────────────┘   └───────────────────┘   └─────────┬─────────┘  │
//! │                                                       │           │
//! │                                   ┌───────────────────┘           │
//! │                                   ▼                               │
//! │                         ValidationWorkerPool (rayon)               │
//! │                                                                   │
//! │  timer thread (std::thread + sleep) ──► onTimerTick / onRetryDue  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use quorate_core::{
    Message, MessagePayload, OrderingEngineSubmit, PreProcessReplyMsg, PreProcessor,
};
use quorate_crypto::{SigningKey, VerifyingKey};
use quorate_types::{ClientId, OffsetInBatch, ReplicaId, Timestamp};

use crate::config::ReplicaConfig;
use crate::error::ReplicaError;
use crate::handler::RequestHandler;
use crate::incoming_queue::IncomingMsgsStorage;
use crate::network::ReceiveLoop;
use crate::transport::{PeerTransport, UdpPeerTransport};
use crate::worker_pool::ValidationWorkerPool;

/// Round-robins batch offsets per client, standing in for the external
/// client-batching component `spec.md` assumes assigns
/// `offset_in_batch` before requests reach the coordinator.
struct OffsetAssigner {
    max: u16,
    next: Mutex<HashMap<ClientId, u16>>,
}

impl OffsetAssigner {
    fn new(max: u16) -> Self {
        Self {
            max: max.max(1),
            next: Mutex::new(HashMap::new()),
        }
    }

    fn next_offset(&self, client: ClientId) -> OffsetInBatch {
        let mut map = self.next.lock().expect("offset assigner lock poisoned");
        let slot = map.entry(client).or_insert(0);
        let offset = *slot;
        *slot = (*slot + 1) % self.max;
        OffsetInBatch::new(offset)
    }
}

/// Owns every thread and shared structure a running replica needs
/// outside the pure `PreProcessor` state machine.
pub struct ReplicaRuntime {
    my_replica_id: ReplicaId,
    num_replicas: u16,
    pre_processor: Arc<PreProcessor>,
    inbox: Arc<IncomingMsgsStorage>,
    worker_pool: Arc<ValidationWorkerPool>,
    transport: Arc<dyn PeerTransport>,
    request_handler: Arc<dyn RequestHandler>,
    offsets: Arc<OffsetAssigner>,
    timers_resolution_ms: u64,
    bind_addr: SocketAddr,

    receive_loop: Option<ReceiveLoop>,
    dispatch_shutdown: Arc<AtomicBool>,
    dispatch_handle: Option<thread::JoinHandle<()>>,
    timer_shutdown: Arc<AtomicBool>,
    timer_handle: Option<thread::JoinHandle<()>>,
}

impl ReplicaRuntime {
    /// Builds a runtime from configuration. Binds the receive socket and
    /// the outbound peer transport but does not yet spawn any threads —
    /// call [`ReplicaRuntime::start`] for that.
    pub fn new(
        config: ReplicaConfig,
        signing_key: SigningKey,
        peer_verifying_keys: HashMap<ReplicaId, VerifyingKey>,
        peer_addrs: HashMap<ReplicaId, SocketAddr>,
        ordering_engine: Arc<dyn OrderingEngineSubmit>,
        request_handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, ReplicaError> {
        let my_replica_id = ReplicaId::new(config.replica_id);
        let primary = ReplicaId::new(config.primary);
        let pp_config = config.consensus.to_preprocessor_config();
        let num_replicas = pp_config.num_replicas;

        let pre_processor = Arc::new(PreProcessor::new(
            my_replica_id,
            primary,
            pp_config,
            signing_key,
            peer_verifying_keys,
            ordering_engine,
        ));

        let inbox = Arc::new(IncomingMsgsStorage::new(config.network.incoming_queue_capacity));
        let worker_pool = Arc::new(ValidationWorkerPool::new(config.network.validation_worker_threads));

        let bind_addr: SocketAddr = config
            .network
            .bind_address
            .parse()
            .map_err(|_| ReplicaError::BindFailed {
                addr: "0.0.0.0:0".parse().unwrap(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad bind address"),
            })?;
        let send_addr: SocketAddr = SocketAddr::new(bind_addr.ip(), 0);
        let transport: Arc<dyn PeerTransport> = Arc::new(
            UdpPeerTransport::bind(send_addr, peer_addrs).map_err(|source| ReplicaError::BindFailed {
                addr: send_addr,
                source,
            })?,
        );

        Ok(Self {
            my_replica_id,
            num_replicas,
            pre_processor,
            inbox,
            worker_pool,
            transport,
            request_handler,
            offsets: Arc::new(OffsetAssigner::new(config.consensus.client_batching_max_msgs_nbr)),
            timers_resolution_ms: config.consensus.timers_resolution_ms,
            bind_addr,
            receive_loop: None,
            dispatch_shutdown: Arc::new(AtomicBool::new(false)),
            dispatch_handle: None,
            timer_shutdown: Arc::new(AtomicBool::new(false)),
            timer_handle: None,
        })
    }

    /// Binds the `mio` receive loop and spawns the dispatch and timer
    /// threads.
    pub fn start(&mut self) -> Result<(), ReplicaError> {
        self.receive_loop = Some(
            ReceiveLoop::spawn(self.bind_addr, Arc::clone(&self.inbox))
                .map_err(|source| ReplicaError::BindFailed { addr: self.bind_addr, source })?,
        );
        self.spawn_dispatch_thread();
        self.spawn_timer_thread();
        Ok(())
    }

    fn spawn_dispatch_thread(&mut self) {
        let inbox = Arc::clone(&self.inbox);
        let worker_pool = Arc::clone(&self.worker_pool);
        let pre_processor = Arc::clone(&self.pre_processor);
        let transport = Arc::clone(&self.transport);
        let request_handler = Arc::clone(&self.request_handler);
        let offsets = Arc::clone(&self.offsets);
        let my_replica_id = self.my_replica_id;
        let num_replicas = self.num_replicas;
        let shutdown = Arc::clone(&self.dispatch_shutdown);

        let handle = thread::Builder::new()
            .name("quorate-dispatch".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    let batch = inbox.pop_batch(64);
                    if batch.is_empty() {
                        thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    for frame in batch {
                        let Ok(message) = frame.into_message() else {
                            quorate_core::METRICS.malformed_message();
                            continue;
                        };
                        if message.validate(num_replicas).is_err() {
                            quorate_core::METRICS.malformed_message();
                            continue;
                        }
                        let ctx = DispatchContext {
                            pre_processor: Arc::clone(&pre_processor),
                            transport: Arc::clone(&transport),
                            request_handler: Arc::clone(&request_handler),
                            offsets: Arc::clone(&offsets),
                            my_replica_id,
                        };
                        if message.should_validate_async() {
                            worker_pool.spawn(move || handle_message(ctx, message));
                        } else {
                            handle_message(ctx, message);
                        }
                    }
                }
            })
            .expect("failed to spawn dispatch thread");

        self.dispatch_handle = Some(handle);
    }

    fn spawn_timer_thread(&mut self) {
        let pre_processor = Arc::clone(&self.pre_processor);
        let transport = Arc::clone(&self.transport);
        let resolution = Duration::from_millis(self.timers_resolution_ms.max(1));
        let shutdown = Arc::clone(&self.timer_shutdown);
        let my_replica_id = self.my_replica_id;

        let handle = thread::Builder::new()
            .name("quorate-timer".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(resolution);
                    let now = Timestamp::now();
                    pre_processor.on_timer_tick(now);
                    for key in pre_processor.table_keys() {
                        if let Some(dispatch) = pre_processor.on_retry_due(key, now) {
                            for (peer, req) in dispatch {
                                let msg = Message::new(my_replica_id, MessagePayload::PreProcessRequest(req));
                                transport.send_to(peer, &msg);
                            }
                        }
                    }
                    pre_processor.publish_metrics();
                }
            })
            .expect("failed to spawn timer thread");

        self.timer_handle = Some(handle);
    }

    /// Admits a client request directly (bypassing the network receive
    /// loop), useful for in-process callers and tests.
    pub fn submit_client_request(
        &self,
        msg: quorate_core::ClientPreProcessRequestMsg,
    ) -> Result<(), quorate_core::PreProcessorError> {
        let offset = self.offsets.next_offset(msg.client_id);
        let client_id = msg.client_id;
        let dispatch = self
            .pre_processor
            .on_client_pre_process_request(msg.clone(), offset, Timestamp::now())?;

        if let Some(dispatch) = dispatch {
            for (peer, req) in &dispatch {
                let out = Message::new(
                    self.my_replica_id,
                    MessagePayload::PreProcessRequest(req.clone()),
                );
                self.transport.send_to(*peer, &out);
            }
            let (data, result) = self.request_handler.execute(&msg.payload);
            self.pre_processor
                .on_primary_pre_processed((client_id, offset), data, result)?;
        }
        Ok(())
    }

    /// Stops the receive, dispatch, and timer threads. Safe to call more
    /// than once.
    pub fn shutdown(&mut self) {
        if let Some(mut receive_loop) = self.receive_loop.take() {
            receive_loop.shutdown();
        }
        self.dispatch_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.dispatch_handle.take() {
            let _ = handle.join();
        }
        self.timer_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.timer_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReplicaRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct DispatchContext {
    pre_processor: Arc<PreProcessor>,
    transport: Arc<dyn PeerTransport>,
    request_handler: Arc<dyn RequestHandler>,
    offsets: Arc<OffsetAssigner>,
    my_replica_id: ReplicaId,
}

fn handle_message(ctx: DispatchContext, message: Message) {
    let now = Timestamp::now();
    match message.payload {
        MessagePayload::ClientPreProcessRequest(msg) => {
            let offset = ctx.offsets.next_offset(msg.client_id);
            let client_id = msg.client_id;
            let payload = msg.payload.clone();
            match ctx.pre_processor.on_client_pre_process_request(msg, offset, now) {
                Ok(Some(dispatch)) => {
                    for (peer, req) in &dispatch {
                        let out = Message::new(
                            ctx.my_replica_id,
                            MessagePayload::PreProcessRequest(req.clone()),
                        );
                        ctx.transport.send_to(*peer, &out);
                    }
                    let (data, result) = ctx.request_handler.execute(&payload);
                    if let Err(err) = ctx
                        .pre_processor
                        .on_primary_pre_processed((client_id, offset), data, result)
                    {
                        tracing::warn!(error = %err, "failed to record primary pre-processed result");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(error = %err, "client pre-process request rejected");
                }
            }
        }
        MessagePayload::PreProcessRequest(req) => {
            let speculative_result = ctx.request_handler.execute(&req.payload);
            match ctx
                .pre_processor
                .on_pre_process_request(message.sender, &req, speculative_result)
            {
                Ok(reply) => {
                    let reply_msg = reply_to_message(ctx.my_replica_id, reply);
                    ctx.transport.send_to(message.sender, &reply_msg);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "pre-process request rejected");
                }
            }
        }
        MessagePayload::PreProcessReply(reply) => {
            if let Err(err) = ctx.pre_processor.on_pre_process_reply(reply, now) {
                tracing::debug!(error = %err, "pre-process reply rejected");
            }
        }
    }
}

fn reply_to_message(sender: ReplicaId, reply: PreProcessReplyMsg) -> Message {
    Message::new(sender, MessagePayload::PreProcessReply(reply))
}
