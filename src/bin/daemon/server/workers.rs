//! Worker Pool
//!
//! A fixed number of worker tasks share one bounded job queue. An idle worker blocks on the
//! queue and takes the next job, so work always lands on a worker with nothing in flight.
//! Each job is one request/response cycle: a TCP connection carrying a single command
//! line, or one bus message whose reply goes back to the acceptor.

use super::envelope::Envelope;
use super::router::{CommandRouter, Context, MessageKind};
use crate::error::{MechError, Result};
use async_std::channel::{self, Receiver, Sender};
use async_std::io::prelude::*;
use async_std::net::TcpStream;
use async_std::task::JoinHandle;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest accepted request line
const MAX_REQUEST_BYTES: usize = 4096;

/// One unit of work
pub enum Job {
    /// Accepted client connection; one line in, one line out
    Tcp { stream: TcpStream, peer: SocketAddr },
    /// Dispatchable bus message and the routing frames to answer on
    Bus { route: Vec<Bytes>, envelope: Envelope },
}

/// Reply to a bus request, sent on the bus socket by the acceptor
#[derive(Debug)]
pub struct BusReply {
    pub route: Vec<Bytes>,
    pub envelope: Envelope,
}

/// What a worker needs to serve a job
pub struct Service {
    router: Arc<CommandRouter>,
    ctx: Arc<Context>,
    bus_name: String,
    client_timeout: Duration,
    replies: Sender<BusReply>,
}

impl Service {
    pub fn new(
        router: Arc<CommandRouter>,
        ctx: Arc<Context>,
        bus_name: impl Into<String>,
        client_timeout: Duration,
        replies: Sender<BusReply>,
    ) -> Self {
        Self {
            router,
            ctx,
            bus_name: bus_name.into(),
            client_timeout,
            replies,
        }
    }

    async fn run(&self, job: Job) {
        match job {
            Job::Tcp { stream, peer } => self.serve_connection(stream, peer).await,
            Job::Bus { route, envelope } => self.serve_bus(route, envelope).await,
        }
    }

    async fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let line = match read_request(&mut stream, self.client_timeout).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("{} closed without a request", peer);
                return;
            }
            Err(e) => {
                warn!("{}: {}", peer, e);
                return;
            }
        };

        let origin = peer.to_string();
        let reply = self
            .router
            .handle(&self.ctx, &origin, &line, MessageKind::Request)
            .await;

        if let Some(reply) = reply {
            let written = async {
                stream.write_all(reply.as_bytes()).await?;
                stream.write_all(b"\r\n").await?;
                stream.flush().await
            };
            if let Err(e) = async_std::io::timeout(self.client_timeout, written).await {
                warn!("Cannot reply to {}: {}", peer, e);
            }
        }
    }

    async fn serve_bus(&self, route: Vec<Bytes>, envelope: Envelope) {
        let Some(kind) = envelope.message_kind() else {
            debug!("Ignoring bus {} from {}", envelope.kind, envelope.source);
            return;
        };
        let origin = format!("bus:{}", envelope.source);
        let reply = self
            .router
            .handle(&self.ctx, &origin, &envelope.body, kind)
            .await;

        if let Some(reply) = reply {
            let answer = envelope.reply_to(&self.bus_name, &reply);
            if self.replies.send(BusReply { route, envelope: answer }).await.is_err() {
                warn!("Bus closed before the reply to {} was sent", envelope.source);
            }
        }
    }
}

/// Read one CR- or LF-terminated line
///
/// # Returns
/// * `Result<Option<String>>` - The line without terminator, `None` if the peer sent nothing
async fn read_request(stream: &mut TcpStream, wait: Duration) -> Result<Option<String>> {
    let mut request = Vec::with_capacity(128);
    let mut buf = [0u8; 512];

    let complete = async_std::io::timeout(wait, async {
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(false);
            }
            request.extend_from_slice(&buf[..n]);
            if request.iter().any(|b| *b == b'\r' || *b == b'\n') {
                return Ok(true);
            }
            if request.len() > MAX_REQUEST_BYTES {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "request line too long",
                ));
            }
        }
    })
    .await?;

    if !complete && request.is_empty() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&request);
    let line = text
        .split(['\r', '\n'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if line.is_empty() {
        return Err(MechError::InvalidArguments("empty request".to_string()));
    }
    Ok(Some(line))
}

/// Keeps the in-flight counter balanced on every exit path
struct LoadGuard<'a>(&'a AtomicUsize);

impl<'a> LoadGuard<'a> {
    fn new(load: &'a AtomicUsize) -> Self {
        load.fetch_add(1, Ordering::AcqRel);
        Self(load)
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fixed set of worker tasks draining a bounded queue
pub struct WorkerPool {
    jobs: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
    load: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `workers` tasks sharing a queue of `queue_depth` jobs
    pub fn start(workers: usize, queue_depth: usize, service: Arc<Service>) -> Self {
        let (jobs, queue) = channel::bounded(queue_depth.max(1));
        let load = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers.max(1))
            .map(|index| {
                let queue: Receiver<Job> = queue.clone();
                let service = service.clone();
                let load = load.clone();
                async_std::task::spawn(async move {
                    debug!("Worker {} started", index);
                    while let Ok(job) = queue.recv().await {
                        let _load = LoadGuard::new(&load);
                        service.run(job).await;
                    }
                    debug!("Worker {} stopped", index);
                })
            })
            .collect::<Vec<_>>();

        info!("Started {} workers, queue depth {}", handles.len(), queue_depth);
        Self { jobs, handles, load }
    }

    /// Queue a job, waiting while the queue is full
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| MechError::IoError(std::io::Error::other("worker pool stopped")))
    }

    /// Jobs currently being served
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting jobs and wait for the queued ones to finish
    pub async fn shutdown(self) {
        self.jobs.close();
        for handle in self.handles {
            handle.await;
        }
        info!("Worker pool stopped");
    }
}
