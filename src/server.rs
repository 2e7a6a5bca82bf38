//! Control-plane server.
//!
//! Clients connect over TCP and send newline-terminated command lines. Each
//! client gets its own thread and [`Session`]; the registry, the plugin set
//! and the agent channel are shared through [`App`].

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::channel::ControlChannel;
use crate::commands;
use crate::config::Config;
use crate::plugin::{HostContext, PluginHost};
use crate::registry::CommandRegistry;

pub struct App {
    config: Config,
    channel: ControlChannel,
    plugins: PluginHost,
    registry: CommandRegistry<Session>,
    target_pid: Mutex<Option<i32>>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let plugins = PluginHost::from_config(&config);
        Self::with_plugins(config, plugins)
    }

    /// Register the built-in commands, then autoload `plugins` when enabled.
    pub fn with_plugins(config: Config, mut plugins: PluginHost) -> Self {
        let mut registry = CommandRegistry::new(config.registry.clone());
        commands::register_builtins(&mut registry);
        if config.autoload {
            let kept = plugins.autoload(None, &mut registry);
            info!(
                "Autoloaded {kept} plugin(s) from {}",
                plugins.dir().display()
            );
        }
        Self {
            channel: ControlChannel::new(config.channel.clone()),
            target_pid: Mutex::new(config.target_pid),
            config,
            plugins,
            registry,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    pub fn plugins(&self) -> &PluginHost {
        &self.plugins
    }

    pub fn registry(&self) -> &CommandRegistry<Session> {
        &self.registry
    }

    pub fn target_pid(&self) -> Option<i32> {
        *self
            .target_pid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_target_pid(&self, pid: Option<i32>) {
        *self
            .target_pid
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = pid;
    }

    pub fn session(self: &Arc<Self>, client: Box<dyn Write + Send>) -> Session {
        Session {
            client,
            app: Arc::clone(self),
        }
    }
}

/// One connected client.
pub struct Session {
    client: Box<dyn Write + Send>,
    app: Arc<App>,
}

impl Session {
    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    pub fn client(&mut self) -> &mut dyn Write {
        &mut *self.client
    }

    pub fn write(&mut self, text: &str) -> io::Result<()> {
        self.client.write_all(text.as_bytes())?;
        self.client.flush()
    }

    /// Services handed to a plugin running on behalf of this client.
    pub fn host_context(&mut self) -> HostContext<'_> {
        let target_pid = self.app.target_pid();
        HostContext::new(
            &mut *self.client,
            &self.app.channel,
            self.app.config.channel.agent,
            target_pid,
        )
    }

    /// Dispatch one command line and write whatever the handler reports.
    pub fn handle_line(&mut self, line: &str) -> io::Result<()> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(());
        }

        let app = Arc::clone(&self.app);
        match app.registry.dispatch(self, line) {
            Some(result) => {
                if !result.success {
                    debug!(line, message = %result.message, "command failed");
                }
                if result.message.is_empty() {
                    return Ok(());
                }
                let mut message = result.message;
                if !message.ends_with('\n') {
                    message.push('\n');
                }
                self.write(&message)
            }
            None => {
                let verb = line.split_whitespace().next().unwrap_or(line);
                self.write(&format!("Unknown command: {verb}\n"))
            }
        }
    }
}

/// Bind the configured listen address and serve until the listener fails.
pub fn serve(app: Arc<App>) -> Result<()> {
    let listen = app.config.listen;
    let listener =
        TcpListener::bind(listen).with_context(|| format!("bind control server on {listen}"))?;
    serve_on(app, listener)
}

pub fn serve_on(app: Arc<App>, listener: TcpListener) -> Result<()> {
    accept_loop(listener, "artscope-client", move |stream| {
        let mut session = app.session(Box::new(stream.try_clone()?));
        for line in BufReader::new(stream).lines() {
            session.handle_line(&line?)?;
        }
        Ok(())
    })
}

/// Accept connections forever, running `handle` on a thread per client.
pub(crate) fn accept_loop<F>(listener: TcpListener, thread_name: &str, handle: F) -> Result<()>
where
    F: Fn(TcpStream) -> io::Result<()> + Send + Sync + 'static,
{
    info!(
        "Listening on {}",
        listener.local_addr().context("listener address")?
    );
    let handle = Arc::new(handle);
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        let handle = Arc::clone(&handle);
        thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                info!("Client connected: {peer}");
                match handle(stream) {
                    Ok(()) => info!("Client disconnected: {peer}"),
                    Err(err) => debug!("Client {peer} dropped: {err}"),
                }
            })
            .context("spawn client thread")?;
    }
    Ok(())
}

/// In-memory client used by tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
