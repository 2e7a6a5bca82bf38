use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PLUGIN_DIR: &str = "~/.config/artscope/plugins";
pub const PLUGIN_DIR_ENV: &str = "ARTSCOPE_PLUGIN_DIR";

#[cfg(target_os = "macos")]
pub const PLUGIN_EXT: &str = ".dylib";
#[cfg(windows)]
pub const PLUGIN_EXT: &str = ".dll";
#[cfg(not(any(target_os = "macos", windows)))]
pub const PLUGIN_EXT: &str = ".so";

pub const DEFAULT_AGENT_PORT: u16 = 1907;
pub const DEFAULT_LISTEN_PORT: u16 = 1906;
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_PLUGIN_RECEIVE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_IDLE_POLLS: u32 = 20;

pub const MAX_COMMANDS: usize = 128;
pub const MAX_COMMAND_NAME_LEN: usize = 64;

/// How a registered command name must line up with the incoming line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// `ping` matches `ping`, `ping x` and also `pingx`.
    #[default]
    LiteralPrefix,
    /// `ping` matches `ping` and `ping x` but not `pingx`.
    WordBoundary,
}

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub capacity: usize,
    pub max_name_len: usize,
    pub policy: MatchPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_COMMANDS,
            max_name_len: MAX_COMMAND_NAME_LEN,
            policy: MatchPolicy::LiteralPrefix,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Where the injected agent listens.
    pub agent: SocketAddr,
    pub receive_timeout: Duration,
    /// Receive timeout used by the plugin `recv` helper.
    pub plugin_receive_timeout: Duration,
    /// Single poll wait while relaying a streamed reply.
    pub poll_interval: Duration,
    /// Consecutive empty polls that end a relayed reply.
    pub idle_polls: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            agent: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_AGENT_PORT)),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            plugin_receive_timeout: DEFAULT_PLUGIN_RECEIVE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_polls: DEFAULT_IDLE_POLLS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub listen: SocketAddr,
    pub plugin_dir: PathBuf,
    pub plugin_ext: String,
    pub autoload: bool,
    pub target_pid: Option<i32>,
    pub channel: ChannelConfig,
    pub registry: RegistryConfig,
}

impl Default for Config {
    fn default() -> Self {
        let plugin_dir = std::env::var_os(PLUGIN_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGIN_DIR));
        Self {
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT)),
            plugin_dir,
            plugin_ext: PLUGIN_EXT.to_string(),
            autoload: true,
            target_pid: None,
            channel: ChannelConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}
