use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::network::{
    Connection, ConnectionId, ConnectionKind, Frame, FrameParser, Listener,
};
use crate::node::{Message, Payload};
use crate::service::NodeConfig;
use crate::transport::{self, TransportKind};
use crate::AppError;
use crate::AppResult;

const PRUNE_INTERVAL: Duration = Duration::from_millis(500);

type ChannelPair<M> = (async_channel::Sender<M>, async_channel::Receiver<M>);

// State shared with the background tasks of one run of the node.
struct NodeContext<T: Payload> {
    pool: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    recv_tx: async_channel::Sender<Message<T>>,
    status_tx: async_channel::Sender<Message<T>>,
    error_tx: async_channel::Sender<AppError>,
    reply_address: String,
    reply_port: u16,
    send_receipts: bool,
    read_buffer_size: usize,
    read_timeout: Duration,
    idle_timeout_ms: i64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

struct NodeRuntime<T: Payload> {
    listener: Listener,
    ctx: Arc<NodeContext<T>>,
}

/// One peer's runtime: a listener for inbound peers plus a pool of outbound
/// connections, exchanging typed messages with delivery receipts.
///
/// Messages arriving from peers are delivered on the `recv` channel; receipts
/// for messages this node sent arrive on the `status` channel; background
/// failures land on the `errors` channel. All three channels are bounded and
/// their producers never block: when a channel is full the item is dropped
/// silently, so consumers must drain promptly. A blocking send here would
/// wedge the connection reader behind a slow consumer.
pub struct Node<T: Payload> {
    config: NodeConfig,
    running: AtomicBool,
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    recv_chan: RwLock<ChannelPair<Message<T>>>,
    status_chan: RwLock<ChannelPair<Message<T>>>,
    error_chan: RwLock<ChannelPair<AppError>>,
    runtime: Mutex<Option<NodeRuntime<T>>>,
}

impl<T: Payload> Node<T> {
    /// Validates the bind address and prepares a stopped node.
    pub fn new(config: NodeConfig) -> AppResult<Node<T>> {
        match transport::transport_kind(&config.bind_address)? {
            TransportKind::Tcp => {}
            TransportKind::Rfcomm => return Err(AppError::NotImplemented),
        }

        let recv_chan = async_channel::bounded(config.recv_chan_buffer_size.max(1));
        let status_chan = async_channel::bounded(config.status_chan_buffer_size.max(1));
        let error_chan = async_channel::bounded(config.error_chan_buffer_size.max(1));

        Ok(Node {
            config,
            running: AtomicBool::new(false),
            connections: Arc::new(DashMap::new()),
            recv_chan: RwLock::new(recv_chan),
            status_chan: RwLock::new(status_chan),
            error_chan: RwLock::new(error_chan),
            runtime: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Local `host:port` the node receives messages on; empty when stopped.
    pub fn reply_address(&self) -> String {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| rt.ctx.reply_address.clone())
            .unwrap_or_default()
    }

    /// Binds the listener and spawns the accept and pruner tasks.
    pub async fn start(&self) -> AppResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AppError::NodeAlreadyRunning);
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> AppResult<()> {
        let (host, port) = transport::host_and_port(&self.config.bind_address)?;

        *self.recv_chan.write() = async_channel::bounded(self.config.recv_chan_buffer_size.max(1));
        *self.status_chan.write() =
            async_channel::bounded(self.config.status_chan_buffer_size.max(1));
        *self.error_chan.write() =
            async_channel::bounded(self.config.error_chan_buffer_size.max(1));

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let error_tx = self.error_chan.read().0.clone();
        let listener = Listener::start(
            &host,
            port,
            &self.config,
            error_tx.clone(),
            &tracker,
            cancel.child_token(),
        )
        .await?;

        let ctx = Arc::new(NodeContext {
            pool: self.connections.clone(),
            recv_tx: self.recv_chan.read().0.clone(),
            status_tx: self.status_chan.read().0.clone(),
            error_tx,
            reply_address: format!("{host}:{port}"),
            reply_port: port,
            send_receipts: self.config.send_message_receipts,
            read_buffer_size: self.config.read_buffer_size.max(1),
            read_timeout: Duration::from_micros(self.config.read_timeout_us),
            idle_timeout_ms: self.config.idle_connection_timeout_ms,
            cancel,
            tracker,
        });

        let accept_rx = listener.accept();
        ctx.tracker
            .spawn(Self::run_accept_pump(ctx.clone(), accept_rx));
        ctx.tracker.spawn(Self::run_idle_pruner(ctx.clone()));

        info!(address = %ctx.reply_address, "node started");
        *self.runtime.lock() = Some(NodeRuntime { listener, ctx });

        Ok(())
    }

    /// Stops the listener, closes every connection, waits for the background
    /// tasks to drain and closes the channels. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        runtime.ctx.cancel.cancel();
        runtime.listener.stop();

        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in connections {
            conn.close().await;
        }

        runtime.ctx.tracker.close();
        runtime.ctx.tracker.wait().await;

        self.recv_chan.read().0.close();
        self.status_chan.read().0.close();
        self.error_chan.read().0.close();

        info!("node stopped");
    }

    /// Sends `data` to a peer, returning the originated message with its id
    /// and send time populated.
    ///
    /// An existing connection to `to_node` is reused when still connected;
    /// otherwise a new one is dialed and a receipt reader is attached to it.
    /// A write failure surfaces as `Closed` and is not retried.
    pub async fn send(&self, to_node: &str, data: Option<T>) -> AppResult<Message<T>> {
        let ctx = self.context()?;

        let payload = match data.as_ref() {
            Some(value) => Some(Bytes::from(value.encode()?)),
            None => None,
        };
        let frame = Frame::new_sent(ctx.reply_port, Utc::now().timestamp_millis(), payload);

        let conn = match self.connection_by_address(to_node) {
            Some(conn) => conn,
            None => self.dial(&ctx, to_node).await?,
        };

        conn.write(&frame.encode()).await?;

        Ok(Message::originated(&frame, data, to_node))
    }

    /// Channel of messages received from peers. Bounded; producers drop on
    /// full.
    pub fn recv(&self) -> async_channel::Receiver<Message<T>> {
        self.recv_chan.read().1.clone()
    }

    /// Channel of receipts for messages this node sent. Bounded; producers
    /// drop on full.
    pub fn status(&self) -> async_channel::Receiver<Message<T>> {
        self.status_chan.read().1.clone()
    }

    /// Channel of background errors. Bounded; producers drop on full.
    pub fn errors(&self) -> async_channel::Receiver<AppError> {
        self.error_chan.read().1.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of the remote addresses across the connection pool.
    pub fn connected_nodes(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.value().remote_address().to_string())
            .collect()
    }

    fn context(&self) -> AppResult<Arc<NodeContext<T>>> {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| rt.ctx.clone())
            .ok_or_else(|| AppError::IllegalState("node is not running".to_string()))
    }

    fn connection_by_address(&self, address: &str) -> Option<Arc<Connection>> {
        self.connections.iter().find_map(|entry| {
            let conn = entry.value();
            (conn.remote_address() == address && conn.is_connected()).then(|| conn.clone())
        })
    }

    async fn dial(&self, ctx: &Arc<NodeContext<T>>, to_node: &str) -> AppResult<Arc<Connection>> {
        if let Some(limit) = self.config.effective_outgoing_limit() {
            let dialed = self
                .connections
                .iter()
                .filter(|entry| entry.value().kind() == ConnectionKind::Dialed)
                .count();
            if dialed >= limit {
                return Err(AppError::ConnectionLimitReached);
            }
        }

        match transport::transport_kind(to_node)? {
            TransportKind::Tcp => {}
            TransportKind::Rfcomm => return Err(AppError::NotImplemented),
        }
        let (host, port) = transport::host_and_port(to_node)?;
        let address = transport::socket_address(&host, port)?;

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_sec);
        let stream = time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| AppError::ConnectTimeout)?
            .map_err(|e| AppError::ConnectAborted(e.to_string()))?;
        stream
            .set_linger(Some(Duration::ZERO))
            .map_err(|e| AppError::SetLingerTimeout(e.to_string()))?;

        debug!(remote = to_node, "dialed connection");
        let conn = Arc::new(Connection::dialed(
            stream,
            to_node.to_string(),
            ctx.read_timeout,
            ctx.idle_timeout_ms,
        ));
        Self::register(ctx, &conn);
        ctx.tracker
            .spawn(Self::run_receipt_reader(ctx.clone(), conn.clone()));

        Ok(conn)
    }

    // Hooks pool removal into the connection's close path and inserts it.
    fn register(ctx: &Arc<NodeContext<T>>, conn: &Arc<Connection>) {
        let pool = Arc::downgrade(&ctx.pool);
        conn.set_close_handler(Box::new(move |id| {
            if let Some(pool) = pool.upgrade() {
                pool.remove(&id);
            }
        }));
        ctx.pool.insert(conn.id(), conn.clone());
    }

    async fn run_accept_pump(
        ctx: Arc<NodeContext<T>>,
        accept_rx: async_channel::Receiver<Arc<Connection>>,
    ) {
        while let Ok(conn) = accept_rx.recv().await {
            Self::register(&ctx, &conn);
            ctx.tracker
                .spawn(Self::run_inbound_reader(ctx.clone(), conn));
        }
        debug!("accept pump exited");
    }

    // Reader for a connection a peer established: parses frames, delivers
    // them on recv and answers each one with a receipt before consuming any
    // further bytes from the connection.
    async fn run_inbound_reader(ctx: Arc<NodeContext<T>>, conn: Arc<Connection>) {
        let peer_host = host_of(conn.remote_address());
        let mut parser = FrameParser::new();
        let mut buf = vec![0u8; ctx.read_buffer_size];
        debug!(id = conn.id(), remote = %conn.remote_address(), "inbound reader started");

        'read: while !ctx.cancel.is_cancelled() && conn.is_connected() {
            let count = match conn.read(&mut buf).await {
                Ok(count) => count,
                Err(_) => break,
            };

            for &byte in &buf[..count] {
                let Some(parsed) = parser.push_byte(byte) else {
                    continue;
                };

                let (message, decode_error) =
                    Message::<T>::arrived(parsed, &peer_host, &ctx.reply_address);
                if let Some(e) = decode_error {
                    let _ = ctx.error_tx.try_send(e);
                }

                let message_id = message.id();
                let receipt_status = message.status();
                let _ = ctx.recv_tx.try_send(message);

                if ctx.send_receipts {
                    let receipt = Frame::new_receipt(
                        message_id,
                        ctx.reply_port,
                        receipt_status,
                        Utc::now().timestamp_millis(),
                    );
                    if let Err(e) = conn.write(&receipt.encode()).await {
                        let _ = ctx.error_tx.try_send(e);
                        break 'read;
                    }
                }
            }
        }

        conn.close().await;
        debug!(id = conn.id(), "inbound reader exited");
    }

    // Reader for a connection this node dialed: everything the peer sends
    // back on it is a receipt and goes to the status channel.
    async fn run_receipt_reader(ctx: Arc<NodeContext<T>>, conn: Arc<Connection>) {
        let peer_host = host_of(conn.remote_address());
        let mut parser = FrameParser::new();
        let mut buf = vec![0u8; ctx.read_buffer_size];
        debug!(id = conn.id(), remote = %conn.remote_address(), "receipt reader started");

        while !ctx.cancel.is_cancelled() && conn.is_connected() {
            let count = match conn.read(&mut buf).await {
                Ok(count) => count,
                Err(_) => break,
            };

            for &byte in &buf[..count] {
                let Some(parsed) = parser.push_byte(byte) else {
                    continue;
                };

                let (receipt, decode_error) =
                    Message::<T>::arrived(parsed, &peer_host, &ctx.reply_address);
                if let Some(e) = decode_error {
                    let _ = ctx.error_tx.try_send(e);
                }
                let _ = ctx.status_tx.try_send(receipt);
            }
        }

        conn.close().await;
        debug!(id = conn.id(), "receipt reader exited");
    }

    // Closes connections that have outlived the idle timeout. Removal from
    // the pool happens through the close handler.
    async fn run_idle_pruner(ctx: Arc<NodeContext<T>>) {
        let mut ticker = time::interval(PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let idle: Vec<Arc<Connection>> = ctx
                .pool
                .iter()
                .filter(|entry| entry.value().is_idle())
                .map(|entry| entry.value().clone())
                .collect();
            for conn in idle {
                debug!(id = conn.id(), remote = %conn.remote_address(), "pruning idle connection");
                conn.close().await;
            }
        }
        debug!("idle pruner exited");
    }
}

fn host_of(address: &str) -> String {
    address.split(':').next().unwrap_or_default().to_string()
}
