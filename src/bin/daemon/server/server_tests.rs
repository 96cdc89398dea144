// Test suite for the server module
// This file contains tests for the router, the generic verbs, the bus envelope and the
// worker pool serving real TCP connections.

use crate::config::{DeviceConfig, DeviceKind};
use crate::device::DeviceRegistry;
use crate::protocol::line::sim::{SimHandle, SimulatedController};
use crate::protocol::register::IoLayout;
use crate::server::commands::init_commands;
use crate::server::router::{
    CommandHandler, CommandRouter, Context, MessageKind, Outcome,
};
use crate::utils::journal::Journal;
use async_std::channel::{self, Receiver};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn line_device(id: u32, name: &str) -> DeviceConfig {
    DeviceConfig {
        id,
        name: name.to_string(),
        kind: DeviceKind::Line,
        endpoint: "sim".to_string(),
        conversion_factor: 0.5,
        min_pos: -1000.0,
        max_pos: 1000.0,
        timeout_seconds: 1,
        liveness_timeout_ms: 500,
        lower_limit_bit: 0,
        upper_limit_bit: 1,
        unit: 1,
    }
}

fn context(configs: &[DeviceConfig]) -> (Arc<Context>, Receiver<()>) {
    let registry = Arc::new(DeviceRegistry::from_configs(configs));
    let (shutdown_tx, shutdown_rx) = channel::bounded(1);
    (
        Arc::new(Context::new(registry, IoLayout::default(), shutdown_tx)),
        shutdown_rx,
    )
}

async fn attach_sim(ctx: &Context, id: u32) -> SimHandle {
    let controller = SimulatedController::new();
    let handle = controller.handle();
    ctx.registry
        .get(id)
        .unwrap()
        .attach_line(Box::new(controller))
        .await;
    handle
}

// Tests for verb lookup and reply formatting
#[cfg(test)]
mod router_tests {
    use super::*;

    /// Records whether it ran
    struct SpyCommand {
        called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CommandHandler for SpyCommand {
        async fn execute(&self, _ctx: &Context, _args: Vec<String>, _kind: MessageKind) -> Outcome {
            self.called.store(true, Ordering::SeqCst);
            Outcome::NoReply
        }

        fn description(&self) -> &str {
            "spy"
        }
    }

    /// Test that the generic verbs are registered
    #[test]
    fn test_commands_registered() {
        let router = init_commands(Journal::disabled());
        for verb in [
            "help", "devices", "status", "busy", "ping", "position", "move", "abort", "reset",
            "lock", "unlock", "limits", "raw", "open", "close", "relays", "sensor", "shutdown",
        ] {
            assert!(router.contains(verb), "{} not registered", verb);
        }
        assert!(router.list_commands().contains("shutdown: Stop the daemon (exec)"));
    }

    /// An unregistered verb is rejected without invoking any handler
    #[async_std::test]
    async fn test_unknown_verb_invokes_nothing() {
        let (ctx, _) = context(&[]);
        let called = Arc::new(AtomicBool::new(false));
        let mut router = CommandRouter::new(Journal::disabled());
        router.register("spy", Box::new(SpyCommand { called: called.clone() }));

        let outcome = router.dispatch(&ctx, "frobnicate now", MessageKind::Request).await;
        assert_eq!(
            outcome,
            Outcome::Error("unrecognized command frobnicate".to_string())
        );
        assert!(!called.load(Ordering::SeqCst));

        // Lookup is case-insensitive and NoReply produces no output
        let reply = router.handle(&ctx, "test", "SPY", MessageKind::Request).await;
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(reply, None);
    }

    #[async_std::test]
    async fn test_empty_and_bad_arguments() {
        let (ctx, _) = context(&[]);
        let router = init_commands(Journal::disabled());

        assert_eq!(
            router.dispatch(&ctx, "   ", MessageKind::Request).await,
            Outcome::Error("empty command".to_string())
        );
        match router.dispatch(&ctx, "move focus", MessageKind::Request).await {
            Outcome::Error(text) => assert!(text.contains("expects 2 arguments")),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_outcome_prefixes() {
        assert_eq!(Outcome::Done("a".into()).reply().unwrap(), "DONE: a");
        assert_eq!(Outcome::Error("b".into()).reply().unwrap(), "ERROR: b");
        assert_eq!(Outcome::Warning("c".into()).reply().unwrap(), "WARNING: c");
        assert_eq!(Outcome::Fatal("d".into()).reply().unwrap(), "FATAL: d");
        assert_eq!(Outcome::NoReply.reply(), None);
    }

    /// Executive-only verbs need an EXEC request
    #[async_std::test]
    async fn test_executive_only() {
        let (ctx, shutdown) = context(&[]);
        let router = init_commands(Journal::disabled());

        match router.dispatch(&ctx, "shutdown", MessageKind::Request).await {
            Outcome::Error(text) => assert!(text.contains("executive")),
            other => panic!("Expected Error, got {:?}", other),
        }
        assert!(shutdown.try_recv().is_err());

        assert_eq!(
            router.dispatch(&ctx, "shutdown", MessageKind::Exec).await,
            Outcome::Done("shutting down".to_string())
        );
        assert!(shutdown.try_recv().is_ok());
    }

    /// Every dispatch lands in the journal, including rejected ones
    #[async_std::test]
    async fn test_dispatch_is_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.log");
        let (ctx, _) = context(&[]);
        let router = init_commands(Journal::new(&path));

        router.handle(&ctx, "10.0.0.1:4000", "help", MessageKind::Request).await;
        router.handle(&ctx, "10.0.0.1:4001", "bogus", MessageKind::Request).await;

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("[10.0.0.1:4001] bogus => ERROR: unrecognized command bogus"));
    }
}

// Tests for the generic verbs against simulated devices
#[cfg(test)]
mod commands_tests {
    use super::*;

    /// STATUS on a device that is mid-operation answers BusyConflict without I/O
    #[async_std::test]
    async fn test_status_while_busy() {
        let (ctx, _) = context(&[line_device(3, "slit")]);
        let sim = attach_sim(&ctx, 3).await;
        let router = init_commands(Journal::disabled());

        let device = ctx.registry.get(3).unwrap();
        let moving = device.try_begin().unwrap();

        let reply = router.handle(&ctx, "test", "STATUS slit", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("ERROR: slit: busy"));
        let reply = router.handle(&ctx, "test", "busy slit", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("DONE: slit busy"));
        assert!(sim.commands().is_empty());

        drop(moving);
        let reply = router.handle(&ctx, "test", "busy slit", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("DONE: slit idle"));
        sim.set_position(40);
        let reply = router.handle(&ctx, "test", "status slit", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("DONE: slit position 20 (ok)"));
    }

    #[async_std::test]
    async fn test_move_and_position() {
        let (ctx, _) = context(&[line_device(1, "focus")]);
        let sim = attach_sim(&ctx, 1).await;
        let router = init_commands(Journal::disabled());

        let reply = router.handle(&ctx, "test", "move focus 12.5", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("DONE: focus moving to 12.5"));
        assert_eq!(sim.position(), 25);

        let reply = router.handle(&ctx, "test", "position focus", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("DONE: 12.5"));
    }

    /// A move after a power cycle restores the last position and retries once
    #[async_std::test]
    async fn test_move_retries_after_power_failure() {
        let (ctx, _) = context(&[line_device(1, "focus")]);
        let sim = attach_sim(&ctx, 1).await;
        let router = init_commands(Journal::disabled());

        ctx.registry.get(1).unwrap().set_position(80.0);
        sim.set_power_up(true);

        let reply = router.handle(&ctx, "test", "move focus 5", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("DONE: focus moving to 5"));
        assert!(!sim.power_up());
        assert!(sim.commands().contains(&"P=80".to_string()));
        assert_eq!(sim.position(), 10);
    }

    #[async_std::test]
    async fn test_lock_blocks_motion() {
        let (ctx, _) = context(&[line_device(1, "focus")]);
        let sim = attach_sim(&ctx, 1).await;
        let router = init_commands(Journal::disabled());

        router.handle(&ctx, "test", "lock focus", MessageKind::Request).await;
        let reply = router.handle(&ctx, "test", "move focus 1", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("ERROR: focus: locked by operator"));
        assert_eq!(sim.position(), 0);

        let reply = router.handle(&ctx, "test", "raw focus MA 900", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("ERROR: focus: locked by operator"));
        let reply = router.handle(&ctx, "test", "raw focus !MA 900", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("ERROR: focus: locked by operator"));
        assert_eq!(sim.position(), 0);

        router.handle(&ctx, "test", "unlock focus", MessageKind::Request).await;
        let reply = router.handle(&ctx, "test", "move focus 1", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("DONE: focus moving to 1"));
    }

    /// Both limit switches asserted is reported as fatal
    #[async_std::test]
    async fn test_limits_fault_is_fatal() {
        let (ctx, _) = context(&[line_device(1, "focus")]);
        let sim = attach_sim(&ctx, 1).await;
        let router = init_commands(Journal::disabled());

        sim.set_inputs(0b10);
        let reply = router.handle(&ctx, "test", "limits focus", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("WARNING: focus at upper limit"));

        sim.set_inputs(0b11);
        let reply = router.handle(&ctx, "test", "limits focus", MessageKind::Request).await;
        assert_eq!(
            reply.as_deref(),
            Some("FATAL: focus: both limit switches asserted")
        );

        // Motion stays refused while the fault is latched
        let reply = router.handle(&ctx, "test", "move focus 50", MessageKind::Request).await;
        assert_eq!(
            reply.as_deref(),
            Some("FATAL: focus: both limit switches asserted")
        );
        assert!(!sim.commands().iter().any(|c| c.starts_with("MA")));
        assert_eq!(sim.position(), 0);
    }

    #[async_std::test]
    async fn test_raw_and_devices() {
        let (ctx, _) = context(&[line_device(1, "focus")]);
        let sim = attach_sim(&ctx, 1).await;
        let router = init_commands(Journal::disabled());
        sim.set_position(3);

        let reply = router.handle(&ctx, "test", "raw focus PR P,VR", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("DONE: P=3, VR=3.009"));

        let reply = router
            .handle(&ctx, "test", "devices", MessageKind::Request)
            .await
            .unwrap();
        let json = reply.strip_prefix("DONE: ").unwrap();
        let records: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(records[0]["name"], "focus");
        assert_eq!(records[0]["busy"], false);
    }

    #[async_std::test]
    async fn test_unknown_mechanism() {
        let (ctx, _) = context(&[line_device(1, "focus")]);
        let router = init_commands(Journal::disabled());
        let reply = router.handle(&ctx, "test", "ping dome", MessageKind::Request).await;
        assert_eq!(reply.as_deref(), Some("ERROR: Resource not found: mechanism dome"));
    }
}

// Tests for the bus envelope
#[cfg(test)]
mod envelope_tests {
    use crate::server::envelope::{Envelope, EnvelopeType};
    use crate::server::router::MessageKind;

    #[test]
    fn test_parse_and_display() {
        let envelope: Envelope = "tcs>mechd EXEC shutdown".parse().unwrap();
        assert_eq!(envelope.source, "tcs");
        assert_eq!(envelope.destination, "mechd");
        assert_eq!(envelope.kind, EnvelopeType::Exec);
        assert_eq!(envelope.body, "shutdown");
        assert_eq!(envelope.message_kind(), Some(MessageKind::Exec));
        assert_eq!(envelope.to_string(), "tcs>mechd EXEC shutdown");

        let status: Envelope = "tcs>mechd STATUS".parse().unwrap();
        assert_eq!(status.body, "");
        assert_eq!(status.message_kind(), None);
    }

    #[test]
    fn test_reply_to() {
        let request: Envelope = "tcs>mechd REQ move focus 2".parse().unwrap();
        let reply = request.reply_to("mechd", "ERROR: focus: busy");
        assert_eq!(reply.to_string(), "mechd>tcs ERROR focus: busy");
    }

    #[test]
    fn test_malformed() {
        assert!("tcs REQ help".parse::<Envelope>().is_err());
        assert!("tcs>mechd ASK help".parse::<Envelope>().is_err());
        assert!(">mechd REQ help".parse::<Envelope>().is_err());
    }
}

// Tests for the worker pool behind a real listener
#[cfg(test)]
mod pool_tests {
    use super::*;
    use crate::protocol::line::transport::LineTransport;
    use crate::server::acceptor::Acceptor;
    use crate::server::workers::{Service, WorkerPool};
    use async_std::io::{ReadExt, WriteExt};
    use async_std::net::TcpStream;
    use std::io;
    use std::time::Duration;
    use zeromq::prelude::*;
    use zeromq::{DealerSocket, ZmqMessage};

    /// Simulator wrapper that flags overlapping exchanges on one device
    struct WindowLink {
        inner: SimulatedController,
        active: Arc<AtomicUsize>,
        windows: Arc<AtomicUsize>,
        overlap: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LineTransport for WindowLink {
        async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlap.store(true, Ordering::SeqCst);
            }
            self.windows.fetch_add(1, Ordering::SeqCst);
            self.inner.write_all(bytes).await
        }

        async fn read_some(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<usize> {
            let n = self.inner.read_some(buf, wait).await?;
            if n > 0 && matches!(buf[n - 1], b'>' | b'?') {
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(n)
        }

        fn describe(&self) -> String {
            "window".to_string()
        }
    }

    async fn request(addr: std::net::SocketAddr, line: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\r").await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    /// N workers serving N*M connections against 50 ms devices: every request is answered
    /// and no device ever sees two exchanges at once
    #[async_std::test]
    async fn test_pool_concurrency() {
        const WORKERS: usize = 4;
        const PER_WORKER: usize = 6;
        let names = ["focus", "slit", "grating"];

        let configs: Vec<DeviceConfig> = names
            .iter()
            .enumerate()
            .map(|(i, name)| line_device(i as u32 + 1, name))
            .collect();
        let (ctx, shutdown_rx) = context(&configs);

        let overlap = Arc::new(AtomicBool::new(false));
        let windows = Arc::new(AtomicUsize::new(0));
        for id in 1..=names.len() as u32 {
            let inner = SimulatedController::new();
            inner.handle().set_latency(Duration::from_millis(50));
            let window = WindowLink {
                inner,
                active: Arc::new(AtomicUsize::new(0)),
                windows: windows.clone(),
                overlap: overlap.clone(),
            };
            ctx.registry.get(id).unwrap().attach_line(Box::new(window)).await;
        }

        let router = Arc::new(init_commands(Journal::disabled()));
        let (reply_tx, reply_rx) = channel::unbounded();
        let service = Arc::new(Service::new(
            router,
            ctx.clone(),
            "mechd",
            Duration::from_secs(5),
            reply_tx,
        ));
        let pool = WorkerPool::start(WORKERS, 64, service);
        assert_eq!(pool.workers(), WORKERS);

        let acceptor = Acceptor::bind("127.0.0.1:0", "", pool, reply_rx, shutdown_rx)
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let server = async_std::task::spawn(acceptor.run());

        let clients: Vec<_> = (0..WORKERS * PER_WORKER)
            .map(|i| {
                let name = names[i % names.len()];
                async_std::task::spawn(async move {
                    request(addr, &format!("position {}", name)).await
                })
            })
            .collect();

        let mut done = 0;
        for client in clients {
            let reply = client.await;
            assert!(reply.ends_with("\r\n"), "unterminated reply {:?}", reply);
            if reply.starts_with("DONE: ") {
                done += 1;
            } else {
                assert!(reply.contains(": busy"), "unexpected reply {:?}", reply);
            }
        }

        assert!(done >= names.len());
        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(windows.load(Ordering::SeqCst), done);

        ctx.request_shutdown();
        server.await.unwrap();
        assert!(ctx.registry.iter().all(|device| !device.is_busy()));
    }

    /// Send one envelope and return the answering envelope
    async fn ask(dealer: &mut DealerSocket, text: &str) -> String {
        dealer.send(ZmqMessage::from(text.to_string())).await.unwrap();
        let reply = async_std::future::timeout(Duration::from_secs(5), dealer.recv())
            .await
            .unwrap()
            .unwrap();
        let frame = reply.into_vec().pop().unwrap();
        String::from_utf8(frame.to_vec()).unwrap()
    }

    /// REQ and EXEC envelopes are served by the pool and answered on the caller's route
    #[async_std::test]
    async fn test_bus_round_trip() {
        let (ctx, shutdown_rx) = context(&[line_device(1, "focus")]);
        let sim = attach_sim(&ctx, 1).await;
        sim.set_position(8);

        let router = Arc::new(init_commands(Journal::disabled()));
        let (reply_tx, reply_rx) = channel::unbounded();
        let service = Arc::new(Service::new(
            router,
            ctx.clone(),
            "mechd",
            Duration::from_secs(5),
            reply_tx,
        ));
        let pool = WorkerPool::start(2, 8, service);
        let acceptor = Acceptor::bind(
            "127.0.0.1:0",
            "tcp://127.0.0.1:0",
            pool,
            reply_rx,
            shutdown_rx,
        )
        .await
        .unwrap();
        let endpoint = acceptor.bus_endpoint().unwrap().to_string();
        let server = async_std::task::spawn(acceptor.run());

        let mut dealer = DealerSocket::new();
        dealer.connect(&endpoint).await.unwrap();

        assert_eq!(
            ask(&mut dealer, "tcs>mechd REQ position focus").await,
            "mechd>tcs DONE 4"
        );
        assert_eq!(
            ask(&mut dealer, "tcs>mechd REQ shutdown").await,
            "mechd>tcs ERROR shutdown requires an executive request"
        );

        // Status broadcasts are not dispatched and get no answer
        dealer
            .send(ZmqMessage::from("tcs>mechd STATUS ready".to_string()))
            .await
            .unwrap();

        assert_eq!(
            ask(&mut dealer, "tcs>mechd EXEC shutdown").await,
            "mechd>tcs DONE shutting down"
        );
        server.await.unwrap();
        assert_eq!(sim.commands(), vec!["PR P".to_string()]);
    }
}
