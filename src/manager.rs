// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Connection Manager
//!
//! Keeps exactly one broker connection alive. A supervising task dials the
//! broker, builds a fresh resource generation on every successful dial (one
//! producer plus `concurrency` consumer tasks per registration) and waits for
//! either the connection to drop or a shutdown request. Lost connections are
//! torn down and redialed after a fixed interval, forever, until shutdown.
//!
//! The active connection, the producer and the consumer registry live behind a
//! single mutex so that registrations and generation transitions never
//! interleave. Consumer tasks are tracked in a join set; tearing a generation
//! down waits for all of its tasks, which is what lets `shutdown` guarantee
//! that no handler runs after it returns.

use crate::{
    channel::LapinConnector,
    configs::RabbitMQConfigs,
    consumer,
    errors::AmqpError,
    handler::ConsumerHandler,
    publisher::Producer,
    registry::{ConsumerConfig, ConsumerRegistry},
    transport::{AmqpConnection, AmqpConnector},
};
use std::sync::Arc;
use tokio::{
    sync::{watch, Mutex},
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// States of the supervising state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The connection was lost; the generation is being torn down.
    Closed,
    ShuttingDown,
    Terminated,
}

/// Snapshot published on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStatus {
    pub state: ConnectionState,
    /// Last generation that was set up, 0 before the first connection.
    pub generation: u64,
}

/// How a connected generation ended.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Lost,
    Shutdown,
}

/// The connection of the live generation.
struct ActiveConnection {
    conn: Arc<dyn AmqpConnection>,
    generation: u64,
    retired: CancellationToken,
}

#[derive(Default)]
struct State {
    active: Option<ActiveConnection>,
    producer: Option<Arc<Producer>>,
    registry: ConsumerRegistry,
    tasks: JoinSet<()>,
    generation: u64,
}

struct Inner {
    cfg: RabbitMQConfigs,
    connector: Arc<dyn AmqpConnector>,
    shutdown: CancellationToken,
    state: Mutex<State>,
    status: watch::Sender<ManagerStatus>,
}

/// Resilient connection manager. Construct one per broker and share it by
/// reference (or `Arc`) with whatever needs to register consumers or publish.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates a manager that dials the broker through `connector`. Nothing is
    /// dialed until [`ConnectionManager::start`].
    pub fn new(cfg: RabbitMQConfigs, connector: Arc<dyn AmqpConnector>) -> Self {
        let (status, _) = watch::channel(ManagerStatus {
            state: ConnectionState::Disconnected,
            generation: 0,
        });

        ConnectionManager {
            inner: Arc::new(Inner {
                cfg,
                connector,
                shutdown: CancellationToken::new(),
                state: Mutex::new(State::default()),
                status,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Creates a manager backed by lapin.
    pub fn lapin(cfg: RabbitMQConfigs) -> Self {
        Self::new(cfg, Arc::new(LapinConnector))
    }

    /// Spawns the supervising task. Must be called from within a tokio runtime.
    pub async fn start(&self) -> Result<(), AmqpError> {
        self.inner.cfg.validate()?;

        let mut supervisor = self.supervisor.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return Err(AmqpError::ShutdownRequested);
        }
        if supervisor.is_some() {
            return Err(AmqpError::AlreadyStarted);
        }

        *supervisor = Some(tokio::spawn(self.inner.clone().supervise()));
        Ok(())
    }

    /// Requests graceful termination and waits until the supervising task,
    /// every consumer task and the connection are gone.
    ///
    /// Safe to call more than once, concurrently, and before `start`. The
    /// supervisor lock is held while joining, so a concurrent caller returns
    /// only once the first one has finished tearing down.
    pub async fn shutdown(&self) {
        info!("closing rabbitmq connection manager");
        self.inner.shutdown.cancel();

        let mut supervisor = self.supervisor.lock().await;
        if let Some(handle) = supervisor.take() {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "rabbitmq connection manager task failed");
            }
        }
        drop(supervisor);

        let generation = self.inner.state.lock().await.generation;
        self.inner.publish_status(ConnectionState::Terminated, generation);
    }

    /// Registers a consumer for `queue`.
    ///
    /// When a connection is live its instances start right away; otherwise they
    /// start with the next generation. Every following generation relaunches it
    /// with the same parameters.
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to consume from; must not be empty
    /// * `auto_ack` - Whether the broker acknowledges deliveries on send
    /// * `concurrency` - Number of consumer tasks per generation; at least 1
    /// * `handler` - Handler invoked for every delivery
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `InvalidConsumer` when the parameters are
    ///   rejected, in which case nothing is registered
    pub async fn register_consumer(
        &self,
        queue: &str,
        auto_ack: bool,
        concurrency: usize,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let cfg = ConsumerConfig::new(queue, auto_ack, concurrency, handler)?;

        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let cfg = state.registry.register(cfg);
        debug!(queue, auto_ack, concurrency, "consumer registered");

        if let Some(active) = state.active.as_ref().filter(|a| a.conn.is_open()) {
            consumer::launch(active.conn.as_ref(), active.generation, &cfg, &mut state.tasks).await;
        }

        Ok(())
    }

    /// Returns the producer of the live generation. Fetch it again after a
    /// reconnect: a handle from an earlier generation refuses to publish.
    ///
    /// # Returns
    /// * `Result<Arc<Producer>, AmqpError>` - `NotConnected` while no generation
    ///   is live
    pub async fn producer(&self) -> Result<Arc<Producer>, AmqpError> {
        self.inner
            .state
            .lock()
            .await
            .producer
            .clone()
            .ok_or(AmqpError::NotConnected)
    }

    /// Current state and generation.
    pub fn status(&self) -> ManagerStatus {
        *self.inner.status.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ManagerStatus> {
        self.inner.status.subscribe()
    }

    /// Number of registered consumer configurations.
    pub async fn registered_consumers(&self) -> usize {
        self.inner.state.lock().await.registry.len()
    }
}

impl Inner {
    fn publish_status(&self, state: ConnectionState, generation: u64) {
        self.status.send_replace(ManagerStatus { state, generation });
    }

    async fn supervise(self: Arc<Self>) {
        info!("starting rabbitmq connection manager");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let generation = self.state.lock().await.generation;
            self.publish_status(ConnectionState::Connecting, generation);

            let dialed = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                dialed = self.connector.connect(&self.cfg.uri, &self.cfg.connection_name) => dialed,
            };

            match dialed {
                Ok(conn) => {
                    if self.handle_connection(conn).await == Exit::Shutdown {
                        break;
                    }
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        retry_in_seconds = self.cfg.reconnect_interval_seconds,
                        "failed to connect to rabbitmq"
                    );
                    self.publish_status(ConnectionState::Disconnected, generation);
                }
            }

            if !self.wait_retry_interval().await {
                break;
            }
        }

        let generation = self.state.lock().await.generation;
        self.publish_status(ConnectionState::Terminated, generation);
        info!("stopping rabbitmq connection manager");
    }

    /// Sleeps for the reconnect interval. Returns false when shutdown was
    /// requested meanwhile.
    async fn wait_retry_interval(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = sleep(self.cfg.reconnect_interval()) => true,
        }
    }

    /// Runs one connected generation until it is lost or shutdown is requested.
    async fn handle_connection(&self, conn: Arc<dyn AmqpConnection>) -> Exit {
        let generation = self.setup_resources(conn.clone()).await;

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!(generation, "shutting down rabbitmq connection gracefully");
                self.publish_status(ConnectionState::ShuttingDown, generation);
                self.tear_down().await;
                Exit::Shutdown
            }
            _ = conn.closed() => {
                warn!(generation, "rabbitmq connection lost, reconnecting");
                self.publish_status(ConnectionState::Closed, generation);
                self.tear_down().await;
                self.publish_status(ConnectionState::Disconnected, generation);
                Exit::Lost
            }
        }
    }

    /// Builds the producer and the consumer tasks of a new generation. When the
    /// producer channel cannot be opened the connection is closed, which sends
    /// the supervisor down the connection-lost path.
    async fn setup_resources(&self, conn: Arc<dyn AmqpConnection>) -> u64 {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        state.generation += 1;
        let generation = state.generation;
        let retired = CancellationToken::new();

        state.active = Some(ActiveConnection {
            conn: conn.clone(),
            generation,
            retired: retired.clone(),
        });

        let channel = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    generation, "failed to create producer channel, will force reconnect"
                );
                if let Err(err) = conn.close().await {
                    debug!(error = err.to_string(), "failure to close connection");
                }
                return generation;
            }
        };
        state.producer = Some(Producer::new(channel, generation, retired));

        let mut launched = 0;
        for cfg in state.registry.iter() {
            launched += consumer::launch(conn.as_ref(), generation, cfg, &mut state.tasks).await;
        }

        info!(
            generation,
            consumers = launched,
            "rabbitmq connection established and resources configured"
        );
        self.publish_status(ConnectionState::Connected, generation);
        generation
    }

    /// Retires the live generation: the producer goes stale, its channel and
    /// the connection are closed, then every consumer task is awaited.
    async fn tear_down(&self) {
        let (active, producer, mut tasks) = {
            let mut state = self.state.lock().await;
            (
                state.active.take(),
                state.producer.take(),
                std::mem::take(&mut state.tasks),
            )
        };

        if let Some(active) = &active {
            active.retired.cancel();
        }

        if let Some(producer) = producer {
            producer.close().await;
        }

        if let Some(active) = active {
            if active.conn.is_open() {
                if let Err(err) = active.conn.close().await {
                    debug!(
                        error = err.to_string(),
                        generation = active.generation,
                        "failure to close connection"
                    );
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = err.to_string(), "consumer task failed");
            }
        }
    }
}
