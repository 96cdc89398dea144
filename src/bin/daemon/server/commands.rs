//! Commands Module
//!
//! This module registers the generic verb set with the command router. Each verb is a plain
//! async function over the shared [`Context`]; mechanism names are resolved through the
//! device registry, relay and sensor names through the I/O layout.

use super::router::{CommandHandler, CommandRouter, Context, MessageKind, Outcome, VerbCommand};
use crate::config::DeviceKind;
use crate::device::Device;
use crate::error::{MechError, Result};
use crate::protocol::line::LimitState;
use crate::protocol::register::{Direction, RelayState};
use crate::utils::journal::Journal;
use crate::verb_command;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{info, warn};

/// Initialize all available commands in the router
///
/// # Arguments
/// * `journal` - Sink for the dispatch journal
///
/// # Returns
/// * `CommandRouter` - A router containing every verb
pub fn init_commands(journal: Journal) -> CommandRouter {
    let mut router = CommandRouter::new(journal);

    // Registry queries
    router.register(
        "devices",
        verb_command!("List every device record as JSON", "", Some(0), devices),
    );
    router.register(
        "status",
        verb_command!("Refresh and report one mechanism", "<mech>", Some(1), status),
    );
    router.register(
        "busy",
        verb_command!("Report whether an operation is in flight", "<mech>", Some(1), busy),
    );
    router.register(
        "ping",
        verb_command!("Check that a mechanism answers", "<mech>", Some(1), ping),
    );

    // Motion
    router.register(
        "position",
        verb_command!("Read the position in physical units", "<mech>", Some(1), position),
    );
    router.register(
        "move",
        verb_command!("Move to an absolute position", "<mech> <pos>", Some(2), move_to),
    );
    router.register(
        "abort",
        verb_command!("Stop motion immediately", "<mech>", Some(1), abort),
    );
    router.register(
        "reset",
        verb_command!(
            "Clear the power failure flag and restore the last position",
            "<mech>",
            Some(1),
            reset
        ),
    );
    router.register(
        "lock",
        verb_command!("Lock a mechanism against motion", "<mech>", Some(1), lock),
    );
    router.register(
        "unlock",
        verb_command!("Release an operator lock", "<mech>", Some(1), unlock),
    );
    router.register(
        "limits",
        verb_command!("Read the limit switches", "<mech>", Some(1), limits),
    );
    router.register(
        "raw",
        verb_command!("Send a raw controller command", "<mech> <text...>", None, raw),
    );

    // Fieldbus I/O
    router.register(
        "open",
        verb_command!("Open a relay circuit", "<relay>", Some(1), open_relay),
    );
    router.register(
        "close",
        verb_command!("Close a relay circuit", "<relay>", Some(1), close_relay),
    );
    router.register(
        "relays",
        verb_command!("Report every relay on a module", "<module>", Some(1), relays),
    );
    router.register(
        "sensor",
        verb_command!("Read a calibrated sensor", "<name>", Some(1), sensor),
    );

    router.register(
        "shutdown",
        Box::new(VerbCommand {
            description: "Stop the daemon".to_string(),
            usage: String::new(),
            expected_args: Some(0),
            executive_only: true,
            executor: shutdown,
        }),
    );

    let listing = router.list_commands();
    router.register("help", Box::new(HelpCommand { listing }));

    router
}

/// `help`: the verb listing, fixed once every other verb is registered
struct HelpCommand {
    listing: String,
}

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn execute(&self, _ctx: &Context, _args: Vec<String>, _kind: MessageKind) -> Outcome {
        Outcome::Done(self.listing.replace('\n', "; "))
    }

    fn description(&self) -> &str {
        "List commands"
    }

    fn expected_args(&self) -> Option<usize> {
        Some(0)
    }
}

fn mechanism(ctx: &Context, args: &[String]) -> Result<Arc<Device>> {
    let name = args
        .first()
        .ok_or_else(|| MechError::InvalidArguments("mechanism name required".to_string()))?;
    ctx.registry.find(name)
}

fn flags(device: &Device) -> String {
    let mut flags = Vec::new();
    if device.is_locked() {
        flags.push("locked");
    }
    if device.power_failed() {
        flags.push("power-failed");
    }
    if device.has_fault() {
        flags.push("fault");
    }
    if flags.is_empty() {
        "ok".to_string()
    } else {
        flags.join(",")
    }
}

async fn relay_report(ctx: &Context, module: &Device) -> Result<String> {
    let mut states = Vec::new();
    for relay in ctx.fieldbus.layout().relays_on(module.id()) {
        let state = ctx.fieldbus.relay_state(&relay.name).await?;
        states.push(format!("{}={}", relay.name, state));
    }
    if states.is_empty() {
        Ok(format!("{} has no relays", module.name()))
    } else {
        Ok(states.join(", "))
    }
}

fn devices<'a>(ctx: &'a Context, _args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        match serde_json::to_string(&ctx.registry.snapshots()) {
            Ok(json) => Outcome::Done(json),
            Err(e) => Outcome::Error(format!("cannot encode device records: {}", e)),
        }
    })
}

fn status<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let result: Result<String> = async {
            let device = mechanism(ctx, &args)?;
            match device.kind() {
                DeviceKind::Line => {
                    let raw = ctx.line.read_position_into_registry(device.id()).await?;
                    Ok(format!(
                        "{} position {} ({})",
                        device.name(),
                        device.to_physical(raw),
                        flags(&device)
                    ))
                }
                DeviceKind::Register => relay_report(ctx, &device).await,
            }
        }
        .await;
        result.into()
    })
}

fn busy<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let result: Result<String> = async {
            let device = mechanism(ctx, &args)?;
            let busy = match device.kind() {
                DeviceKind::Line => ctx.line.is_busy(device.id())?,
                DeviceKind::Register => device.is_busy(),
            };
            Ok(format!("{} {}", device.name(), if busy { "busy" } else { "idle" }))
        }
        .await;
        result.into()
    })
}

fn ping<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let result: Result<String> = async {
            let device = mechanism(ctx, &args)?;
            match device.kind() {
                DeviceKind::Line => {
                    let version = ctx.line.query(device.id()).await?;
                    Ok(format!("{} alive, firmware {}", device.name(), version))
                }
                DeviceKind::Register => {
                    let mut word = [0u16; 1];
                    ctx.fieldbus
                        .register_transfer(
                            Direction::Read,
                            device.id(),
                            device.unit(),
                            0,
                            &mut word,
                            1,
                        )
                        .await?;
                    Ok(format!("{} alive", device.name()))
                }
            }
        }
        .await;
        result.into()
    })
}

fn position<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let result: Result<String> = async {
            let device = mechanism(ctx, &args)?;
            let raw = ctx.line.read_position_into_registry(device.id()).await?;
            Ok(device.to_physical(raw).to_string())
        }
        .await;
        result.into()
    })
}

fn move_to<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let result: Result<String> = async {
            let device = mechanism(ctx, &args)?;
            let target: f64 = args[1].parse()?;
            match ctx.line.move_absolute(device.id(), target).await {
                Err(MechError::PowerFailureFlag { .. }) => {
                    warn!(
                        "{} reported a power failure, restoring position and retrying",
                        device.name()
                    );
                    ctx.line.clear_power_failure(device.id()).await?;
                    ctx.line.move_absolute(device.id(), target).await?;
                }
                other => {
                    other?;
                }
            }
            Ok(format!("{} moving to {}", device.name(), target))
        }
        .await;
        result.into()
    })
}

fn abort<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let result: Result<String> = async {
            let device = mechanism(ctx, &args)?;
            ctx.line.stop_mechanism(device.id()).await?;
            Ok(format!("{} stopped", device.name()))
        }
        .await;
        result.into()
    })
}

fn reset<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let result: Result<String> = async {
            let device = mechanism(ctx, &args)?;
            ctx.line.clear_power_failure(device.id()).await?;
            Ok(format!(
                "{} reset at {}",
                device.name(),
                device.to_physical(device.position())
            ))
        }
        .await;
        result.into()
    })
}

fn set_lock(ctx: &Context, args: &[String], locked: bool) -> Outcome {
    match mechanism(ctx, args) {
        Ok(device) => {
            device.set_locked(locked);
            info!("{} {}", device.name(), if locked { "locked" } else { "unlocked" });
            Outcome::Done(format!(
                "{} {}",
                device.name(),
                if locked { "locked" } else { "unlocked" }
            ))
        }
        Err(e) => e.into(),
    }
}

fn lock<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move { set_lock(ctx, &args, true) })
}

fn unlock<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move { set_lock(ctx, &args, false) })
}

fn limits<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let device = match mechanism(ctx, &args) {
            Ok(device) => device,
            Err(e) => return e.into(),
        };
        match ctx.line.check_limit_bits(device.id()).await {
            Ok(LimitState::Clear) => Outcome::Done(format!("{} limits clear", device.name())),
            Ok(LimitState::Lower) => Outcome::Warning(format!("{} at lower limit", device.name())),
            Ok(LimitState::Upper) => Outcome::Warning(format!("{} at upper limit", device.name())),
            Err(e) => e.into(),
        }
    })
}

fn raw<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        if args.len() < 2 {
            return Outcome::Error("usage: raw <mech> <text...>".to_string());
        }
        let result: Result<String> = async {
            let device = mechanism(ctx, &args)?;
            ctx.line
                .tech_passthrough(device.id(), &args[1..].join(" "))
                .await
        }
        .await;
        result.into()
    })
}

async fn switch_relay(ctx: &Context, name: &str, state: RelayState) -> Outcome {
    match ctx.fieldbus.set_relay(name, state).await {
        Ok(()) => Outcome::Done(format!("{} {}", name, state)),
        Err(e) => e.into(),
    }
}

fn open_relay<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move { switch_relay(ctx, &args[0], RelayState::Off).await })
}

fn close_relay<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move { switch_relay(ctx, &args[0], RelayState::On).await })
}

fn relays<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let result: Result<String> = async {
            let module = mechanism(ctx, &args)?;
            module.expect_kind(DeviceKind::Register)?;
            relay_report(ctx, &module).await
        }
        .await;
        result.into()
    })
}

fn sensor<'a>(ctx: &'a Context, args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        match ctx.fieldbus.read_sensor(&args[0]).await {
            Ok(reading) => Outcome::Done(format!(
                "{} {:.2} {} (raw {})",
                reading.name, reading.value, reading.units, reading.raw
            )),
            Err(e) => e.into(),
        }
    })
}

fn shutdown<'a>(ctx: &'a Context, _args: Vec<String>) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        info!("Shutdown requested by executive command");
        ctx.request_shutdown();
        Outcome::Done("shutting down".to_string())
    })
}
