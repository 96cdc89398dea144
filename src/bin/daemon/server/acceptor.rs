use super::envelope::Envelope;
use super::workers::{BusReply, Job, WorkerPool};
use crate::error::{MechError, Result};
use async_std::channel::Receiver;
use async_std::net::{TcpListener, TcpStream};
use bytes::Bytes;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use zeromq::prelude::*;
use zeromq::{RouterSocket, ZmqError, ZmqMessage};

/// Maximum bus message size (1MB)
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
/// Pause after a failed accept or bus receive so a persistent error does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Event {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Bus(std::result::Result<ZmqMessage, ZmqError>),
    Reply(Option<BusReply>),
    Shutdown,
}

/// Front door of the daemon: the TCP listener and the message bus share one loop
pub struct Acceptor {
    listener: TcpListener,
    bus: Option<RouterSocket>,
    bus_address: Option<String>,
    pool: WorkerPool,
    replies: Receiver<BusReply>,
    shutdown: Receiver<()>,
}

impl Acceptor {
    /// Bind the listener and, unless `bus_endpoint` is empty, the bus socket
    ///
    /// # Arguments
    /// * `listen` - TCP address, e.g. `0.0.0.0:10435`
    /// * `bus_endpoint` - ZeroMQ endpoint for the ROUTER socket
    /// * `pool` - Workers that serve accepted jobs
    /// * `replies` - Bus replies coming back from the workers
    /// * `shutdown` - Stops the loop when a message arrives or every sender is gone
    pub async fn bind(
        listen: &str,
        bus_endpoint: &str,
        pool: WorkerPool,
        replies: Receiver<BusReply>,
        shutdown: Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        info!("Listening on {}", listener.local_addr()?);

        let (bus, bus_address) = if bus_endpoint.is_empty() {
            info!("Message bus disabled");
            (None, None)
        } else {
            let mut socket = RouterSocket::new();
            let bound = socket.bind(bus_endpoint).await.map_err(|e| {
                MechError::ConfigError(format!("cannot bind {}: {}", bus_endpoint, e))
            })?;
            info!("Message bus on {}", bound);
            (Some(socket), Some(bound.to_string()))
        };

        Ok(Self {
            listener,
            bus,
            bus_address,
            pool,
            replies,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Resolved bus endpoint, `None` when the bus is disabled
    pub fn bus_endpoint(&self) -> Option<&str> {
        self.bus_address.as_deref()
    }

    /// Run until shutdown, then drain the worker pool
    pub async fn run(self) -> Result<()> {
        let Acceptor {
            listener,
            mut bus,
            bus_address: _,
            pool,
            replies,
            shutdown,
        } = self;

        loop {
            let event = {
                let accept = listener.accept().fuse();
                let bus_recv = async {
                    match bus.as_mut() {
                        Some(socket) => socket.recv().await,
                        None => futures::future::pending().await,
                    }
                }
                .fuse();
                let reply = replies.recv().fuse();
                let stop = shutdown.recv().fuse();
                futures::pin_mut!(accept, bus_recv, reply, stop);

                futures::select! {
                    accepted = accept => Event::Accepted(accepted),
                    message = bus_recv => Event::Bus(message),
                    reply = reply => Event::Reply(reply.ok()),
                    _ = stop => Event::Shutdown,
                }
            };

            match event {
                Event::Accepted(Ok((stream, peer))) => {
                    debug!("Accepted {} (load {})", peer, pool.load());
                    if let Err(e) = pool.submit(Job::Tcp { stream, peer }).await {
                        error!("Cannot queue connection from {}: {}", peer, e);
                    }
                }
                Event::Accepted(Err(e)) => {
                    warn!("Accept failed: {}", e);
                    async_std::task::sleep(ACCEPT_BACKOFF).await;
                }
                Event::Bus(Ok(message)) => match split_bus_message(message) {
                    Ok((route, envelope)) => {
                        if envelope.message_kind().is_some() {
                            if let Err(e) = pool.submit(Job::Bus { route, envelope }).await {
                                error!("Cannot queue bus request: {}", e);
                            }
                        } else {
                            info!("Bus {}: {}", envelope.kind, envelope);
                        }
                    }
                    Err(e) => warn!("Dropping bus message: {}", e),
                },
                Event::Bus(Err(e)) => {
                    error!("Error receiving bus message: {:?}", e);
                    async_std::task::sleep(ACCEPT_BACKOFF).await;
                }
                Event::Reply(Some(reply)) => send_reply(bus.as_mut(), reply).await,
                Event::Reply(None) => {
                    warn!("Bus reply channel closed");
                    break;
                }
                Event::Shutdown => {
                    info!("Shutdown signal received, stopping acceptor");
                    break;
                }
            }
        }

        drop(listener);
        pool.shutdown().await;

        // Replies of jobs that finished while stopping, the `shutdown` answer included
        while let Ok(reply) = replies.try_recv() {
            send_reply(bus.as_mut(), reply).await;
        }
        Ok(())
    }
}

async fn send_reply(bus: Option<&mut RouterSocket>, reply: BusReply) {
    let Some(socket) = bus else {
        return;
    };
    let text = reply.envelope.to_string();
    if let Err(e) = socket.send(bus_message(reply.route, text)).await {
        warn!("Cannot send bus reply: {:?}", e);
    }
}

/// Split a ROUTER message into its routing frames and the parsed envelope
fn split_bus_message(message: ZmqMessage) -> Result<(Vec<Bytes>, Envelope)> {
    let mut frames = message.into_vec();
    let payload = frames
        .pop()
        .ok_or_else(|| MechError::ParseError("empty bus message".to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(MechError::InvalidArguments(format!(
            "bus message too large: {} bytes (max: {})",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let text = std::str::from_utf8(&payload)
        .map_err(|e| MechError::ParseError(format!("invalid UTF-8 bus message: {}", e)))?;
    Ok((frames, text.parse()?))
}

/// Reassemble routing frames and a payload into one message
fn bus_message(route: Vec<Bytes>, payload: String) -> ZmqMessage {
    let mut message = ZmqMessage::from(payload);
    for frame in route.into_iter().rev() {
        message.push_front(frame);
    }
    message
}
