//! Built-in control-plane commands.

use std::sync::Arc;

use tracing::warn;

use crate::error::ArtscopeError;
use crate::registry::{CommandLine, CommandRegistry, CommandResult};
use crate::server::Session;

pub fn register_builtins(registry: &mut CommandRegistry<Session>) {
    registry.register("ping", "Test connection", ping);
    registry.register("plugins", "List loaded plugins", plugins);
    registry.register("sec", "List ELF sections of a library in the target", sec);
    registry.register("help", "List available commands", help);
}

fn written(result: std::io::Result<()>) -> CommandResult {
    match result {
        Ok(()) => CommandResult::ok(""),
        Err(err) => CommandResult::fail(format!("write to client failed: {err}")),
    }
}

fn ping(session: &mut Session, _line: &CommandLine<'_>) -> CommandResult {
    written(session.write("pong\n"))
}

fn plugins(session: &mut Session, _line: &CommandLine<'_>) -> CommandResult {
    let app = Arc::clone(session.app());
    written(app.plugins().list(session.client()))
}

fn help(session: &mut Session, _line: &CommandLine<'_>) -> CommandResult {
    let app = Arc::clone(session.app());
    written(app.registry().list(session.client()))
}

/// Forward the whole line to the agent and relay its reply.
fn sec(session: &mut Session, line: &CommandLine<'_>) -> CommandResult {
    let app = Arc::clone(session.app());
    if app.target_pid().is_none() {
        return CommandResult::fail(format!("ERROR: {}\n", ArtscopeError::NoTargetPid.user_message()));
    }

    let agent = app.config().channel.agent;
    match app.channel().relay(agent, line.raw, session.client()) {
        Ok(_) => CommandResult::ok(""),
        Err(err) => {
            warn!("sec: {err}");
            CommandResult::fail(format!("ERROR: {}\n", err.user_message()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, Config};
    use crate::plugin::testing::FakeLoader;
    use crate::plugin::PluginHost;
    use crate::server::{App, SharedBuffer};
    use std::io::{BufRead, BufReader, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::thread;
    use std::time::Duration;

    fn app(agent: Option<SocketAddr>, pid: Option<i32>) -> Arc<App> {
        let mut config = Config {
            target_pid: pid,
            ..Config::default()
        };
        if let Some(agent) = agent {
            config.channel = ChannelConfig {
                agent,
                poll_interval: Duration::from_millis(20),
                idle_polls: 5,
                ..ChannelConfig::default()
            };
        }
        let plugins = PluginHost::with_loader(FakeLoader::default(), "/nonexistent", ".so");
        Arc::new(App::with_plugins(config, plugins))
    }

    fn run(app: &Arc<App>, line: &str) -> String {
        let out = SharedBuffer::default();
        let mut session = app.session(Box::new(out.clone()));
        session.handle_line(line).unwrap();
        out.contents()
    }

    #[test]
    fn ping_replies_pong() {
        let app = app(None, None);
        assert_eq!(run(&app, "ping"), "pong\n");
        assert_eq!(run(&app, "ping extra"), "pong\n");
    }

    #[test]
    fn plugins_with_none_loaded() {
        assert_eq!(run(&app(None, None), "plugins"), "No plugins loaded.\n");
    }

    #[test]
    fn help_lists_builtins() {
        let listing = run(&app(None, None), "help");
        assert!(listing.starts_with("Available commands (4):\n"));
        assert!(listing.contains("  ping - Test connection\n"));
        assert!(listing.contains("  sec - "));
    }

    #[test]
    fn sec_without_target_pid() {
        assert_eq!(
            run(&app(None, None), "sec libart.so"),
            "ERROR: No target PID set. Please attach/spawn first.\n"
        );
    }

    #[test]
    fn sec_with_unreachable_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let agent = listener.local_addr().unwrap();
        drop(listener);
        assert_eq!(
            run(&app(Some(agent), Some(1234)), "sec libart.so"),
            "ERROR: Failed to connect to agent\n"
        );
    }

    #[test]
    fn sec_relays_agent_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let agent = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).unwrap();
            writer.write_all(b".text 0x1000\n").unwrap();
            writer.write_all(b".data 0x2000\n").unwrap();
            line
        });

        let reply = run(&app(Some(agent), Some(1234)), "sec libart.so");
        assert_eq!(server.join().unwrap(), "sec libart.so\n");
        assert_eq!(reply, ".text 0x1000\n.data 0x2000\n");
    }
}
