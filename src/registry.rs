//! Bounded, append-only command table with literal-prefix dispatch.
//!
//! The same table backs the control-plane server and the in-process agent;
//! only the context handed to handlers differs. Entries are registered during
//! startup and never removed, so dispatch only needs shared access.

use std::io::{self, Write};

use tracing::{error, info, warn};

use crate::config::{MatchPolicy, RegistryConfig};
use crate::error::ArtscopeError;

/// A command line as seen by a handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandLine<'a> {
    /// Whole line, without the trailing newline.
    pub raw: &'a str,
    /// Text after the matched name, leading whitespace removed.
    pub args: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub trait CommandHandler<C: ?Sized>: Send + Sync {
    fn run(&self, ctx: &mut C, line: &CommandLine<'_>) -> CommandResult;
}

impl<C: ?Sized, F> CommandHandler<C> for F
where
    F: Fn(&mut C, &CommandLine<'_>) -> CommandResult + Send + Sync,
{
    fn run(&self, ctx: &mut C, line: &CommandLine<'_>) -> CommandResult {
        self(ctx, line)
    }
}

pub struct CommandEntry<C: ?Sized> {
    name: String,
    description: String,
    handler: Box<dyn CommandHandler<C>>,
}

impl<C: ?Sized> CommandEntry<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

pub struct CommandRegistry<C: ?Sized> {
    entries: Vec<CommandEntry<C>>,
    config: RegistryConfig,
}

impl<C: ?Sized> CommandRegistry<C> {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            entries: Vec::with_capacity(config.capacity),
            config,
        }
    }

    /// Append a command. A full table or an oversized name is logged and the
    /// registration dropped; earlier entries are untouched.
    pub fn register<H>(&mut self, name: &str, description: &str, handler: H) -> bool
    where
        H: CommandHandler<C> + 'static,
    {
        if self.entries.len() >= self.config.capacity {
            error!(
                command = name,
                "{}",
                ArtscopeError::RegistryFull {
                    capacity: self.config.capacity
                }
            );
            return false;
        }
        if name.is_empty() {
            warn!("refusing to register a command with an empty name");
            return false;
        }
        if name.len() >= self.config.max_name_len {
            warn!(
                "{}",
                ArtscopeError::NameTooLong {
                    name: name.to_string(),
                    max: self.config.max_name_len - 1,
                }
            );
            return false;
        }

        self.entries.push(CommandEntry {
            name: name.to_string(),
            description: description.to_string(),
            handler: Box::new(handler),
        });
        info!("Registered command: {name}");
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn entries(&self) -> impl Iterator<Item = &CommandEntry<C>> {
        self.entries.iter()
    }

    /// First entry, in registration order, whose name starts the line.
    pub fn find<'l>(&self, line: &'l str) -> Option<(&CommandEntry<C>, CommandLine<'l>)> {
        let raw = line.trim_end_matches(['\r', '\n']);
        self.entries.iter().find_map(|entry| {
            let rest = raw.strip_prefix(entry.name.as_str())?;
            if self.config.policy == MatchPolicy::WordBoundary
                && !rest.is_empty()
                && !rest.starts_with(char::is_whitespace)
            {
                return None;
            }
            Some((
                entry,
                CommandLine {
                    raw,
                    args: rest.trim_start(),
                },
            ))
        })
    }

    /// Run the matching handler. `None` when nothing matched.
    pub fn dispatch(&self, ctx: &mut C, line: &str) -> Option<CommandResult> {
        let (entry, line) = self.find(line)?;
        Some(entry.handler.run(ctx, &line))
    }

    pub fn list(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut buf = format!("Available commands ({}):\n", self.entries.len());
        for entry in &self.entries {
            if entry.description.is_empty() {
                buf.push_str(&format!("  {}\n", entry.name));
            } else {
                buf.push_str(&format!("  {} - {}\n", entry.name, entry.description));
            }
        }
        out.write_all(buf.as_bytes())
    }
}

impl<C: ?Sized> Default for CommandRegistry<C> {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the name of the handler that ran and the arguments it saw.
    type Trace = Vec<(String, String)>;

    fn recorder(tag: &'static str) -> impl CommandHandler<Trace> {
        move |trace: &mut Trace, line: &CommandLine<'_>| {
            trace.push((tag.to_string(), line.args.to_string()));
            CommandResult::ok("")
        }
    }

    fn registry(policy: MatchPolicy, capacity: usize) -> CommandRegistry<Trace> {
        CommandRegistry::new(RegistryConfig {
            capacity,
            max_name_len: 64,
            policy,
        })
    }

    #[test]
    fn ping_matches_with_and_without_arguments() {
        let mut reg = registry(MatchPolicy::LiteralPrefix, 8);
        assert!(reg.register("ping", "", recorder("ping")));

        let mut trace = Trace::new();
        assert!(reg.dispatch(&mut trace, "ping").is_some());
        assert!(reg.dispatch(&mut trace, "ping extra\n").is_some());
        assert_eq!(
            trace,
            vec![
                ("ping".to_string(), String::new()),
                ("ping".to_string(), "extra".to_string()),
            ]
        );
    }

    #[test]
    fn leading_whitespace_before_arguments_is_trimmed() {
        let mut reg = registry(MatchPolicy::LiteralPrefix, 8);
        reg.register("sec", "", recorder("sec"));

        let mut trace = Trace::new();
        reg.dispatch(&mut trace, "sec  \t libart.so");
        assert_eq!(trace[0].1, "libart.so");
    }

    #[test]
    fn literal_prefix_matches_glued_suffix() {
        let mut reg = registry(MatchPolicy::LiteralPrefix, 8);
        reg.register("ping", "", recorder("ping"));

        let mut trace = Trace::new();
        assert!(reg.dispatch(&mut trace, "pingx").is_some());
        assert_eq!(trace, vec![("ping".to_string(), "x".to_string())]);
    }

    #[test]
    fn word_boundary_rejects_glued_suffix() {
        let mut reg = registry(MatchPolicy::WordBoundary, 8);
        reg.register("ping", "", recorder("ping"));

        let mut trace = Trace::new();
        assert!(reg.dispatch(&mut trace, "pingx").is_none());
        assert!(reg.dispatch(&mut trace, "ping").is_some());
        assert!(reg.dispatch(&mut trace, "ping x").is_some());
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn first_registered_entry_wins() {
        let mut reg = registry(MatchPolicy::LiteralPrefix, 8);
        reg.register("hook", "", recorder("hook"));
        reg.register("hooktype", "", recorder("hooktype"));

        let mut trace = Trace::new();
        reg.dispatch(&mut trace, "hooktype pltgot");
        assert_eq!(trace[0].0, "hook");
    }

    #[test]
    fn unmatched_line_is_a_no_op() {
        let mut reg = registry(MatchPolicy::LiteralPrefix, 8);
        reg.register("ping", "", recorder("ping"));

        let mut trace = Trace::new();
        assert_eq!(reg.dispatch(&mut trace, "pong"), None);
        assert!(trace.is_empty());
    }

    #[test]
    fn registration_past_capacity_is_dropped() {
        let mut reg = registry(MatchPolicy::LiteralPrefix, 2);
        assert!(reg.register("a", "", recorder("a")));
        assert!(reg.register("b", "", recorder("b")));
        assert!(!reg.register("c", "", recorder("c")));

        assert_eq!(reg.len(), 2);
        assert!(reg.contains("a"));
        assert!(reg.contains("b"));
        assert!(!reg.contains("c"));

        let mut trace = Trace::new();
        assert!(reg.dispatch(&mut trace, "a").is_some());
        assert!(reg.dispatch(&mut trace, "c").is_none());
    }

    #[test]
    fn oversized_and_empty_names_are_rejected() {
        let mut reg = registry(MatchPolicy::LiteralPrefix, 8);
        let long = "x".repeat(64);
        assert!(!reg.register(&long, "", recorder("long")));
        assert!(!reg.register("", "", recorder("empty")));
        assert!(reg.register(&"y".repeat(63), "", recorder("max")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn list_is_in_registration_order() -> io::Result<()> {
        let mut reg = registry(MatchPolicy::LiteralPrefix, 8);
        reg.register("ping", "Test connection", recorder("ping"));
        reg.register("sec", "", recorder("sec"));

        let mut out = Vec::new();
        reg.list(&mut out)?;
        assert_eq!(
            String::from_utf8_lossy(&out),
            "Available commands (2):\n  ping - Test connection\n  sec\n"
        );
        Ok(())
    }

    #[test]
    fn handler_result_is_returned() {
        let mut reg = registry(MatchPolicy::LiteralPrefix, 8);
        reg.register("fail", "", |_: &mut Trace, _: &CommandLine<'_>| {
            CommandResult::fail("nope")
        });
        let mut trace = Trace::new();
        assert_eq!(
            reg.dispatch(&mut trace, "fail"),
            Some(CommandResult::fail("nope"))
        );
    }
}
