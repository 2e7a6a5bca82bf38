use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::agent::{AgentConfig, HookKind};
use crate::config::{Config, MatchPolicy};

#[derive(Parser, Debug)]
#[command(
    name = "artscope",
    about = "Android runtime introspection: control server, agent and plugin host",
    version,
    propagate_version = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Log filter: a level (error, warn, info, debug, trace) or a RUST_LOG directive.
    #[arg(long = "log-level", value_name = "FILTER", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control-plane server: built-ins, plugins and the agent relay.
    Serve(ServeCommand),
    /// Run the agent command server in this process.
    Agent(AgentCommand),
    /// Send one command line to the agent and stream its reply.
    Exec(ExecCommand),
    /// Resolve symbol candidates inside a running process.
    Resolve(ResolveCommand),
    /// Load plugins from the plugin directory and print their metadata.
    Plugins(PluginsCommand),
}

#[derive(Args, Debug, Clone)]
pub struct ServeCommand {
    /// Address the control server listens on.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Address of the injected agent.
    #[arg(long, value_name = "ADDR")]
    pub agent: Option<SocketAddr>,

    /// Target process id, required by commands that reach into the target.
    #[arg(long, value_name = "PID")]
    pub pid: Option<i32>,

    /// Plugin directory (defaults to ~/.config/artscope/plugins).
    #[arg(long = "plugin-dir", value_name = "DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Do not load plugins at startup.
    #[arg(long = "no-autoload", action = ArgAction::SetTrue)]
    pub no_autoload: bool,

    /// Require a command name to be followed by whitespace or end of line.
    #[arg(long = "word-boundary", action = ArgAction::SetTrue)]
    pub word_boundary: bool,
}

impl ServeCommand {
    pub fn to_config(&self) -> Config {
        let mut cfg = Config::default();
        if let Some(listen) = self.listen {
            cfg.listen = listen;
        }
        if let Some(agent) = self.agent {
            cfg.channel.agent = agent;
        }
        cfg.target_pid = self.pid;
        if let Some(dir) = &self.plugin_dir {
            cfg.plugin_dir = dir.clone();
        }
        cfg.autoload = !self.no_autoload;
        if self.word_boundary {
            cfg.registry.policy = MatchPolicy::WordBoundary;
        }
        cfg
    }
}

#[derive(Args, Debug, Clone)]
pub struct AgentCommand {
    /// Address the agent listens on.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Default hook type.
    #[arg(long = "hook-type", value_enum)]
    pub hook_type: Option<HookKind>,

    /// Extra on-disk libart copies to read symbols from.
    #[arg(long = "libart", value_name = "PATH")]
    pub libart: Vec<PathBuf>,
}

impl AgentCommand {
    pub fn to_agent_config(&self) -> AgentConfig {
        let mut cfg = AgentConfig::default();
        if let Some(listen) = self.listen {
            cfg.listen = listen;
        }
        if let Some(kind) = self.hook_type {
            cfg.hook_kind = kind;
        }
        if !self.libart.is_empty() {
            let mut paths = self.libart.clone();
            paths.append(&mut cfg.libart_paths);
            cfg.libart_paths = paths;
        }
        cfg
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExecCommand {
    /// Address of the agent.
    #[arg(long, value_name = "ADDR")]
    pub agent: Option<SocketAddr>,

    /// Command line to send, e.g. `sec libart.so`.
    #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl ExecCommand {
    pub fn line(&self) -> String {
        self.command.join(" ")
    }

    pub fn to_config(&self) -> Config {
        let mut cfg = Config::default();
        if let Some(agent) = self.agent {
            cfg.channel.agent = agent;
        }
        cfg
    }
}

#[derive(Args, Debug, Clone)]
pub struct ResolveCommand {
    /// Process to inspect; defaults to this process.
    #[arg(long, value_name = "PID")]
    pub pid: Option<i32>,

    /// Substring of the library path, e.g. `libart.so`.
    pub library: String,

    /// Candidate symbol names, tried in order.
    #[arg(required = true, value_name = "SYMBOL")]
    pub symbols: Vec<String>,

    /// Additional on-disk copies of the library.
    #[arg(long = "fallback", value_name = "PATH")]
    pub fallback: Vec<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct PluginsCommand {
    /// Plugin directory (defaults to ~/.config/artscope/plugins).
    #[arg(long = "plugin-dir", value_name = "DIR")]
    pub plugin_dir: Option<PathBuf>,

    /// Print metadata as JSON.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}

impl PluginsCommand {
    pub fn to_config(&self) -> Config {
        let mut cfg = Config::default();
        if let Some(dir) = &self.plugin_dir {
            cfg.plugin_dir = dir.clone();
        }
        cfg
    }
}
