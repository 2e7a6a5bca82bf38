use std::sync::Arc;

use crate::registry::{CommandHandler, CommandLine, CommandResult};
use crate::server::Session;

use super::Plugin;

const DEFAULT_DESCRIPTION: &str = "Plugin command";

/// Registry entry that forwards a command line to a plugin's `exec`.
pub struct PluginCommand {
    plugin: Arc<Plugin>,
    name: String,
    description: String,
}

impl PluginCommand {
    /// `None` unless the plugin has a name and an `exec` export.
    pub fn new(plugin: &Arc<Plugin>) -> Option<Self> {
        let meta = plugin.metadata().filter(|meta| meta.name.is_some())?;
        if !plugin.extension().has_exec() {
            return None;
        }
        Some(Self {
            plugin: Arc::clone(plugin),
            name: meta.command_name()?.to_string(),
            description: meta
                .description
                .clone()
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Everything after the first space of the raw line, if non-empty.
fn plugin_args(raw: &str) -> Option<&str> {
    raw.split_once(' ')
        .map(|(_, rest)| rest)
        .filter(|rest| !rest.is_empty())
}

impl CommandHandler<Session> for PluginCommand {
    fn run(&self, session: &mut Session, line: &CommandLine<'_>) -> CommandResult {
        let mut host = session.host_context();
        match self
            .plugin
            .extension()
            .exec(&mut host, plugin_args(line.raw))
        {
            Some(0) => CommandResult::ok(""),
            Some(_) => CommandResult::fail(""),
            None => CommandResult::fail("Plugin has no exec function"),
        }
    }
}
