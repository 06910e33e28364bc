use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpSocket;
use tokio::sync::Semaphore;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::network::Connection;
use crate::service::NodeConfig;
use crate::transport;
use crate::AppError;
use crate::AppResult;

/// Accepts inbound connections and hands them to the node over a bounded
/// channel.
///
/// The inbound cap is a semaphore: each accepted connection holds one permit
/// until it is dropped, and a dial that arrives with no permit left is
/// rejected on the spot (the socket is dropped and `ConnectionLimitReached`
/// goes to the error channel).
pub struct Listener {
    local_address: String,
    accept_rx: async_channel::Receiver<Arc<Connection>>,
    cancel: CancellationToken,
}

impl Listener {
    pub(crate) async fn start(
        host: &str,
        port: u16,
        config: &NodeConfig,
        error_tx: async_channel::Sender<AppError>,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> AppResult<Listener> {
        let bind_address = transport::socket_address(host, port)?;

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_reuseport(true)?;
        socket.bind(bind_address)?;
        let tcp_listener = socket.listen(1024)?;
        let local_address = tcp_listener.local_addr()?.to_string();
        info!(address = %local_address, "listener started");

        let limit = config.effective_incoming_limit();
        let semaphore = Arc::new(Semaphore::new(limit.unwrap_or(Semaphore::MAX_PERMITS)));
        let (accept_tx, accept_rx) = match limit {
            Some(capacity) => async_channel::bounded(capacity),
            None => async_channel::unbounded(),
        };

        let read_timeout = Duration::from_micros(config.read_timeout_us);
        let idle_timeout_ms = config.idle_connection_timeout_ms;
        let accept_cancel = cancel.clone();

        tracker.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = tcp_listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer_address)) => {
                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                let _ = error_tx.try_send(AppError::ConnectionLimitReached);
                                continue;
                            }
                        };

                        if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
                            let _ =
                                error_tx.try_send(AppError::SetLingerTimeout(e.to_string()));
                            continue;
                        }

                        debug!(peer = %peer_address, "accepted connection");
                        let conn = Arc::new(Connection::accepted(
                            stream,
                            peer_address.to_string(),
                            read_timeout,
                            idle_timeout_ms,
                            Some(permit),
                        ));
                        if accept_tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if accept_cancel.is_cancelled() {
                            break;
                        }
                        let _ = error_tx.try_send(AppError::Accept(e.to_string()));
                        time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            accept_tx.close();
            debug!("listener accept loop exited");
        });

        Ok(Listener {
            local_address,
            accept_rx,
            cancel,
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Stream of accepted connections; closed when the listener stops.
    pub(crate) fn accept(&self) -> async_channel::Receiver<Arc<Connection>> {
        self.accept_rx.clone()
    }

    /// Cancels the accept loop and closes the accept channel. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
