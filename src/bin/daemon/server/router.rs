//! Command Router Module
//!
//! Verb table for the daemon. Each verb maps to a [`CommandHandler`]; the router looks verbs
//! up case-insensitively, enforces argument counts and executive privilege, turns the
//! handler's [`Outcome`] into a reply line and journals every dispatch.

use crate::device::DeviceRegistry;
use crate::error::MechError;
use crate::protocol::line::LineClient;
use crate::protocol::register::{IoLayout, RegisterClient};
use crate::utils::journal::Journal;
use async_std::channel::Sender;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Privilege attached to an incoming request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Ordinary request from a TCP client or a bus REQ
    Request,
    /// Bus EXEC; may run executive-only verbs
    Exec,
}

/// Result of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done(String),
    Error(String),
    Warning(String),
    Fatal(String),
    /// The caller expects no reply
    NoReply,
}

impl Outcome {
    /// Reply prefix without the colon, `None` for `NoReply`
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            Outcome::Done(_) => Some("DONE"),
            Outcome::Error(_) => Some("ERROR"),
            Outcome::Warning(_) => Some("WARNING"),
            Outcome::Fatal(_) => Some("FATAL"),
            Outcome::NoReply => None,
        }
    }

    /// The reply line sent back to the caller
    pub fn reply(&self) -> Option<String> {
        let tag = self.tag()?;
        match self {
            Outcome::Done(text)
            | Outcome::Error(text)
            | Outcome::Warning(text)
            | Outcome::Fatal(text) => Some(format!("{}: {}", tag, text)),
            Outcome::NoReply => None,
        }
    }
}

impl From<MechError> for Outcome {
    fn from(error: MechError) -> Self {
        if error.is_fatal() {
            Outcome::Fatal(error.to_string())
        } else {
            Outcome::Error(error.to_string())
        }
    }
}

impl From<crate::error::Result<String>> for Outcome {
    fn from(result: crate::error::Result<String>) -> Self {
        match result {
            Ok(text) => Outcome::Done(text),
            Err(e) => e.into(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reply() {
            Some(reply) => write!(f, "{}", reply),
            None => write!(f, "(no reply)"),
        }
    }
}

/// Everything a handler may touch
pub struct Context {
    pub registry: Arc<DeviceRegistry>,
    pub line: LineClient,
    pub fieldbus: RegisterClient,
    shutdown: Sender<()>,
}

impl Context {
    pub fn new(registry: Arc<DeviceRegistry>, layout: IoLayout, shutdown: Sender<()>) -> Self {
        Self {
            line: LineClient::new(registry.clone()),
            fieldbus: RegisterClient::new(registry.clone(), Arc::new(layout)),
            registry,
            shutdown,
        }
    }

    /// Ask the acceptor loop to stop
    pub fn request_shutdown(&self) {
        if self.shutdown.try_send(()).is_err() {
            debug!("Shutdown already requested");
        }
    }
}

/// Trait for command handlers
///
/// Defines the interface that every verb implements to be registered in the router.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute the command with its arguments
    ///
    /// # Arguments
    /// * `ctx` - Devices and protocol clients
    /// * `args` - Whitespace separated arguments after the verb
    /// * `kind` - Privilege of the request
    ///
    /// # Returns
    /// * `Outcome` - The tagged result
    async fn execute(&self, ctx: &Context, args: Vec<String>, kind: MessageKind) -> Outcome;

    /// Get command description
    fn description(&self) -> &str;

    /// Argument synopsis shown by `help` and on argument errors
    fn usage(&self) -> &str {
        ""
    }

    /// Get expected argument count (None = any number)
    fn expected_args(&self) -> Option<usize> {
        None
    }

    /// Whether only executive requests may run the command
    fn executive_only(&self) -> bool {
        false
    }
}

/// Handler body for a [`VerbCommand`]
pub type Executor = for<'a> fn(&'a Context, Vec<String>) -> BoxFuture<'a, Outcome>;

/// Command handler backed by a plain async function
pub struct VerbCommand {
    pub description: String,
    pub usage: String,
    pub expected_args: Option<usize>,
    pub executive_only: bool,
    pub executor: Executor,
}

#[async_trait]
impl CommandHandler for VerbCommand {
    async fn execute(&self, ctx: &Context, args: Vec<String>, _kind: MessageKind) -> Outcome {
        (self.executor)(ctx, args).await
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn usage(&self) -> &str {
        &self.usage
    }

    fn expected_args(&self) -> Option<usize> {
        self.expected_args
    }

    fn executive_only(&self) -> bool {
        self.executive_only
    }
}

/// Macro to create verb handlers
///
/// # Arguments
/// * `$desc` - Command description
/// * `$usage` - Argument synopsis
/// * `$args` - Expected number of arguments, or `None`
/// * `$func` - Executor function
#[macro_export]
macro_rules! verb_command {
    ($desc:expr, $usage:expr, $args:expr, $func:expr) => {
        Box::new($crate::server::router::VerbCommand {
            description: $desc.to_string(),
            usage: $usage.to_string(),
            expected_args: $args,
            executive_only: false,
            executor: $func,
        })
    };
}

/// Verb table with reply formatting and journaling
pub struct CommandRouter {
    commands: HashMap<String, Box<dyn CommandHandler>>,
    journal: Journal,
}

impl CommandRouter {
    /// Create an empty router writing to `journal`
    pub fn new(journal: Journal) -> Self {
        Self {
            commands: HashMap::new(),
            journal,
        }
    }

    /// Register a command handler; verbs are stored lowercase
    pub fn register<S: Into<String>>(&mut self, name: S, handler: Box<dyn CommandHandler>) {
        let name = name.into().to_ascii_lowercase();
        debug!("Registering command: {}", name);
        self.commands.insert(name, handler);
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.commands.contains_key(&verb.to_ascii_lowercase())
    }

    /// List all registered commands with usage and description
    pub fn list_commands(&self) -> String {
        let mut commands: Vec<_> = self.commands.iter().collect();
        commands.sort_by_key(|(name, _)| *name);

        commands
            .iter()
            .map(|(name, handler)| {
                let synopsis = if handler.usage().is_empty() {
                    name.to_string()
                } else {
                    format!("{} {}", name, handler.usage())
                };
                let exec = if handler.executive_only() { " (exec)" } else { "" };
                format!("{}: {}{}", synopsis, handler.description(), exec)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Route one command line to its handler
    ///
    /// Unknown verbs, executive-only verbs on ordinary requests and wrong argument counts
    /// are rejected without invoking any handler.
    pub async fn dispatch(&self, ctx: &Context, cmdline: &str, kind: MessageKind) -> Outcome {
        let mut parts = cmdline.split_whitespace();
        let Some(verb) = parts.next() else {
            warn!("Received empty command");
            return Outcome::Error("empty command".to_string());
        };
        let args: Vec<String> = parts.map(str::to_string).collect();

        let Some(handler) = self.commands.get(&verb.to_ascii_lowercase()) else {
            warn!("Unknown command: {}", verb);
            return Outcome::Error(format!("unrecognized command {}", verb));
        };

        if handler.executive_only() && kind != MessageKind::Exec {
            warn!("Rejected {} from a non-executive request", verb);
            return Outcome::Error(format!("{} requires an executive request", verb));
        }

        if let Some(expected) = handler.expected_args() {
            if args.len() != expected {
                return Outcome::Error(format!(
                    "{} expects {} arguments, got {}; usage: {} {}",
                    verb,
                    expected,
                    args.len(),
                    verb.to_ascii_lowercase(),
                    handler.usage()
                ));
            }
        }

        debug!("Executing command: {} with {} args", verb, args.len());
        handler.execute(ctx, args, kind).await
    }

    /// Dispatch, log and journal one request
    ///
    /// # Arguments
    /// * `ctx` - Handler context
    /// * `origin` - Peer address or bus source, for the log and journal
    /// * `cmdline` - The request line
    /// * `kind` - Privilege of the request
    ///
    /// # Returns
    /// * `Option<String>` - The reply line, `None` when no reply is due
    pub async fn handle(
        &self,
        ctx: &Context,
        origin: &str,
        cmdline: &str,
        kind: MessageKind,
    ) -> Option<String> {
        info!("{} <- {}", origin, cmdline.trim());
        let outcome = self.dispatch(ctx, cmdline, kind).await;
        let reply = outcome.reply();
        info!("{} -> {}", origin, outcome);
        self.journal
            .record(origin, cmdline, reply.as_deref().unwrap_or_default())
            .await;
        reply
    }
}
