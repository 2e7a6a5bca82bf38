//! The in-process agent: a command server living inside the target runtime.
//!
//! It answers the lines the control plane forwards (`sec`, `hooktype`, ...)
//! and owns the reference decoder used by the script bridge.

mod commands;

use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use jni::JavaVM;
use tracing::{debug, info};

use crate::config::{RegistryConfig, DEFAULT_AGENT_PORT};
use crate::error::ArtscopeError;
use crate::refs::layout::LIBART_PATHS;
use crate::refs::{ArtLayout, Decoder};
use crate::registry::CommandRegistry;
use crate::server::accept_loop;
use crate::symbols::Resolver;

/// Hooking mechanism selected for new hooks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "lower")]
pub enum HookKind {
    #[default]
    Trampoline,
    #[value(alias = "plt", alias = "got")]
    Pltgot,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::Trampoline => "trampoline",
            HookKind::Pltgot => "pltgot",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookKind {
    type Err = ArtscopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trampoline" => Ok(HookKind::Trampoline),
            "pltgot" | "plt" | "got" => Ok(HookKind::Pltgot),
            other => Err(ArtscopeError::Config(format!(
                "unknown hook type '{other}' (trampoline|pltgot)"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub listen: SocketAddr,
    pub layout: ArtLayout,
    /// On-disk libart copies tried when the mapped path is unreadable.
    pub libart_paths: Vec<PathBuf>,
    pub hook_kind: HookKind,
    pub registry: RegistryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_AGENT_PORT)),
            layout: ArtLayout::default(),
            libart_paths: LIBART_PATHS.iter().map(PathBuf::from).collect(),
            hook_kind: HookKind::default(),
            registry: RegistryConfig::default(),
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    decoder: Decoder,
    vm: Option<JavaVM>,
    hook_kind: Mutex<HookKind>,
    registry: CommandRegistry<AgentSession>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let resolver = Resolver::new().with_fallback_paths(config.libart_paths.iter().cloned());
        let mut registry = CommandRegistry::new(config.registry.clone());
        commands::register_builtins(&mut registry);
        Self {
            decoder: Decoder::with_resolver(config.layout.clone(), resolver),
            vm: None,
            hook_kind: Mutex::new(config.hook_kind),
            registry,
            config,
        }
    }

    /// Bind the runtime the agent was loaded into.
    pub fn with_vm(mut self, vm: JavaVM) -> Self {
        self.vm = Some(vm);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn vm(&self) -> Option<&JavaVM> {
        self.vm.as_ref()
    }

    pub fn registry(&self) -> &CommandRegistry<AgentSession> {
        &self.registry
    }

    /// Read by the hooking subsystem whenever it installs a hook.
    pub fn hook_kind(&self) -> HookKind {
        *self
            .hook_kind
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_hook_kind(&self, kind: HookKind) {
        *self
            .hook_kind
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = kind;
        info!("Default hook type: {kind}");
    }

    pub fn session(self: &Arc<Self>, client: Box<dyn Write + Send>) -> AgentSession {
        AgentSession {
            client,
            agent: Arc::clone(self),
        }
    }
}

/// One control-plane connection to the agent.
pub struct AgentSession {
    client: Box<dyn Write + Send>,
    agent: Arc<Agent>,
}

impl AgentSession {
    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn client(&mut self) -> &mut dyn Write {
        &mut *self.client
    }

    pub fn write(&mut self, text: &str) -> io::Result<()> {
        self.client.write_all(text.as_bytes())?;
        self.client.flush()
    }

    /// Lines that match no command are ignored.
    pub fn handle_line(&mut self, line: &str) -> io::Result<()> {
        let line = line.trim_end_matches(['\r', '\n']);
        let agent = Arc::clone(&self.agent);
        match agent.registry.dispatch(self, line) {
            Some(result) if !result.message.is_empty() => self.write(&result.message),
            Some(_) => Ok(()),
            None => {
                debug!(line, "no agent command matched");
                Ok(())
            }
        }
    }
}

pub fn serve(agent: Arc<Agent>) -> Result<()> {
    let listen = agent.config.listen;
    let listener =
        TcpListener::bind(listen).with_context(|| format!("bind agent server on {listen}"))?;
    serve_on(agent, listener)
}

pub fn serve_on(agent: Arc<Agent>, listener: TcpListener) -> Result<()> {
    accept_loop(listener, "artscope-agent", move |stream| {
        let mut session = agent.session(Box::new(stream.try_clone()?));
        for line in BufReader::new(stream).lines() {
            session.handle_line(&line?)?;
        }
        Ok(())
    })
}
