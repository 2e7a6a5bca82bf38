//! Dynamically loaded command plugins.
//!
//! Plugins live in a per-user directory and are opened at startup. Each one
//! that exposes metadata and an `exec` function becomes a command in the
//! control-plane registry.

pub mod abi;
mod command;
pub mod context;
mod native;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ArtscopeError, Result};
use crate::registry::CommandRegistry;
use crate::server::Session;

pub use abi::{PluginKind, PluginMetadata};
pub use command::PluginCommand;
pub use context::{HostContext, PluginContext};
pub use native::{NativeLoader, NativePlugin};

/// Exports of one loaded plugin. Each call returns `None` when the
/// corresponding export is missing.
pub trait Extension: Send + Sync {
    fn metadata(&self) -> Option<&PluginMetadata>;
    fn has_exec(&self) -> bool;
    fn init(&self, ctx: Option<&mut HostContext<'_>>) -> Option<i32>;
    fn exec(&self, ctx: &mut HostContext<'_>, input: Option<&str>) -> Option<i32>;
    fn close(&self, ctx: Option<&mut HostContext<'_>>);
}

pub trait Loader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn Extension>>;
}

/// A loaded plugin. The library stays open while any handle to it exists.
pub struct Plugin {
    path: PathBuf,
    extension: Box<dyn Extension>,
    initialized: AtomicBool,
}

impl Plugin {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> Option<&PluginMetadata> {
        self.extension.metadata()
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata()?.name.as_deref()
    }

    pub fn extension(&self) -> &dyn Extension {
        self.extension.as_ref()
    }

    /// Run the plugin's init hook. A missing hook counts as success.
    pub fn init(&self, ctx: Option<&mut HostContext<'_>>) -> Result<()> {
        match self.extension.init(ctx) {
            None | Some(0) => {
                self.initialized.store(true, Ordering::Release);
                Ok(())
            }
            Some(status) => Err(ArtscopeError::PluginInit {
                name: self
                    .name()
                    .map(str::to_string)
                    .unwrap_or_else(|| self.path.display().to_string()),
                status,
            }),
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.metadata().is_some_and(|meta| {
            meta.command.as_deref() == Some(name) || meta.name.as_deref() == Some(name)
        })
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        if self.initialized.load(Ordering::Acquire) {
            self.extension.close(None);
        }
        debug!(path = %self.path.display(), "plugin released");
    }
}

/// What `artscope plugins --json` prints for each plugin.
#[derive(Clone, Debug, Serialize)]
pub struct PluginReport {
    pub path: PathBuf,
    /// Registry name: the command prefix, else the plugin name.
    pub registered_as: Option<String>,
    #[serde(flatten)]
    pub metadata: PluginMetadata,
}

pub struct PluginHost {
    loader: Box<dyn Loader>,
    dir: PathBuf,
    ext: String,
    plugins: Vec<Arc<Plugin>>,
}

impl PluginHost {
    pub fn new(dir: impl AsRef<Path>, ext: impl Into<String>) -> Self {
        Self::with_loader(NativeLoader, dir, ext)
    }

    pub fn with_loader(
        loader: impl Loader + 'static,
        dir: impl AsRef<Path>,
        ext: impl Into<String>,
    ) -> Self {
        Self {
            loader: Box::new(loader),
            dir: expand_home(dir.as_ref()),
            ext: ext.into(),
            plugins: Vec::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.plugin_dir, config.plugin_ext.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Explicit paths (leading `/` or `.`) are used verbatim. Bare names are
    /// looked up in the plugin directory, adding the platform extension when
    /// it is missing.
    pub fn resolve_path(&self, spec: &str) -> PathBuf {
        if spec.starts_with('/') || spec.starts_with('.') {
            return PathBuf::from(spec);
        }
        let mut file = spec.to_string();
        if !file.ends_with(&self.ext) {
            file.push_str(&self.ext);
        }
        self.dir.join(file)
    }

    pub fn load(&mut self, spec: &str) -> Result<Arc<Plugin>> {
        let path = self.resolve_path(spec);
        self.open(path)
    }

    fn open(&mut self, path: PathBuf) -> Result<Arc<Plugin>> {
        let extension = self.loader.load(&path).inspect_err(|err| {
            warn!("[plugin] {err}");
        })?;
        let plugin = Arc::new(Plugin {
            path,
            extension,
            initialized: AtomicBool::new(false),
        });
        self.plugins.push(Arc::clone(&plugin));
        Ok(plugin)
    }

    /// Drop the host's handle to the plugin answering to `name`.
    ///
    /// A command registered for the plugin holds its own `Arc`, so the
    /// library stays open and the command keeps working until the registry
    /// lets go of it as well. `close` runs only then.
    pub fn unload(&mut self, name: &str) -> bool {
        match self.find(name) {
            Some(plugin) => self.remove(&plugin),
            None => false,
        }
    }

    /// Forget `plugin`. Its library is closed once the last handle drops.
    pub fn remove(&mut self, plugin: &Arc<Plugin>) -> bool {
        let before = self.plugins.len();
        self.plugins.retain(|p| !Arc::ptr_eq(p, plugin));
        before != self.plugins.len()
    }

    /// Command prefix or plugin name; the earliest loaded match wins.
    pub fn find(&self, name: &str) -> Option<Arc<Plugin>> {
        self.plugins.iter().find(|p| p.matches(name)).cloned()
    }

    pub fn plugins(&self) -> &[Arc<Plugin>] {
        &self.plugins
    }

    pub fn count(&self) -> usize {
        self.plugins.len()
    }

    pub fn reports(&self) -> Vec<PluginReport> {
        self.plugins
            .iter()
            .map(|plugin| {
                let metadata = plugin.metadata().cloned().unwrap_or_default();
                PluginReport {
                    path: plugin.path().to_path_buf(),
                    registered_as: metadata.command_name().map(str::to_string),
                    metadata,
                }
            })
            .collect()
    }

    pub fn list(&self, out: &mut dyn Write) -> io::Result<()> {
        if self.plugins.is_empty() {
            return out.write_all(b"No plugins loaded.\n");
        }
        let mut buf = format!("Loaded plugins ({}):\n", self.plugins.len());
        for (i, plugin) in self.plugins.iter().enumerate() {
            match plugin.metadata().and_then(|m| m.name.as_deref().map(|n| (n, m))) {
                Some((name, meta)) => buf.push_str(&format!(
                    "  [{}] {} - {}\n",
                    i + 1,
                    name,
                    meta.description.as_deref().unwrap_or("")
                )),
                None => buf.push_str(&format!("  [{}] (unnamed plugin)\n", i + 1)),
            }
        }
        out.write_all(buf.as_bytes())
    }

    /// Open every plugin in the plugin directory and register its command.
    ///
    /// A plugin whose init fails is unloaded and skipped. Returns the number
    /// of plugins kept.
    pub fn autoload(
        &mut self,
        mut ctx: Option<&mut HostContext<'_>>,
        registry: &mut CommandRegistry<Session>,
    ) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %self.dir.display(), "no plugin directory: {err}");
                return 0;
            }
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&self.ext))
            })
            .collect();
        files.sort();

        let mut loaded = 0;
        for path in files {
            let Ok(plugin) = self.open(path.clone()) else {
                continue;
            };
            if let Err(err) = plugin.init(ctx.as_deref_mut()) {
                warn!("[plugin] Init failed for {}: {err}", path.display());
                self.remove(&plugin);
                continue;
            }

            if let Some(command) = PluginCommand::new(&plugin) {
                let name = command.name().to_string();
                if registry.contains(&name) {
                    warn!("[plugin] command '{name}' already registered, keeping existing");
                } else {
                    let description = command.description().to_string();
                    registry.register(&name, &description, command);
                }
            }
            info!(path = %path.display(), "Loaded plugin");
            loaded += 1;
        }
        loaded
    }
}

/// Expand a leading `~` from `$HOME`, falling back to the password database.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    let home = std::env::var_os("HOME").map(PathBuf::from).or_else(|| {
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|user| user.dir)
    });
    match home {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn resolve_path_rules() {
        let host = PluginHost::with_loader(FakeLoader::default(), "/opt/plugins", ".so");
        assert_eq!(host.resolve_path("/abs/x.so"), PathBuf::from("/abs/x.so"));
        assert_eq!(host.resolve_path("./rel.so"), PathBuf::from("./rel.so"));
        assert_eq!(host.resolve_path("dump"), PathBuf::from("/opt/plugins/dump.so"));
        assert_eq!(host.resolve_path("dump.so"), PathBuf::from("/opt/plugins/dump.so"));
    }

    #[test]
    fn tilde_expands_from_home() {
        if let Some(home) = std::env::var_os("HOME") {
            let expanded = expand_home(Path::new("~/.config/artscope/plugins"));
            assert_eq!(
                expanded,
                PathBuf::from(home).join(".config/artscope/plugins")
            );
        }
        assert_eq!(expand_home(Path::new("/etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn load_find_and_unload() {
        let loader = FakeLoader::default().with("dump.so", Scripted::command("dumper", Some("dump")));
        let mut host = PluginHost::with_loader(loader, "/plugins", ".so");

        let plugin = host.load("dump").unwrap();
        assert_eq!(host.count(), 1);
        assert!(Arc::ptr_eq(&host.find("dump").unwrap(), &plugin));
        assert!(Arc::ptr_eq(&host.find("dumper").unwrap(), &plugin));
        assert!(host.find("other").is_none());

        assert!(host.unload("dump"));
        assert!(!host.unload("dump"));
        assert!(!host.remove(&plugin));
        assert_eq!(host.count(), 0);
    }

    #[test]
    fn load_failure_is_reported() {
        let mut host = PluginHost::with_loader(FakeLoader::default(), "/plugins", ".so");
        let err = host.load("missing").err().unwrap();
        assert!(matches!(err, ArtscopeError::PluginLoad { .. }));
        assert_eq!(host.count(), 0);
    }

    #[test]
    fn list_output() -> io::Result<()> {
        let loader = FakeLoader::default()
            .with("a.so", Scripted::command("alpha", None))
            .with("b.so", Scripted::default());
        let mut host = PluginHost::with_loader(loader, "/plugins", ".so");

        let mut out = Vec::new();
        host.list(&mut out)?;
        assert_eq!(out, b"No plugins loaded.\n");

        host.load("a").unwrap();
        host.load("b").unwrap();
        let mut out = Vec::new();
        host.list(&mut out)?;
        assert_eq!(
            String::from_utf8_lossy(&out),
            "Loaded plugins (2):\n  [1] alpha - alpha plugin\n  [2] (unnamed plugin)\n"
        );
        Ok(())
    }

    #[test]
    fn reports_serialize_metadata() {
        let loader = FakeLoader::default().with("dump.so", Scripted::command("dumper", Some("dump")));
        let mut host = PluginHost::with_loader(loader, "/plugins", ".so");
        host.load("dump").unwrap();

        let json = serde_json::to_value(host.reports()).unwrap();
        assert_eq!(json[0]["path"], "/plugins/dump.so");
        assert_eq!(json[0]["name"], "dumper");
        assert_eq!(json[0]["command"], "dump");
        assert_eq!(json[0]["registered_as"], "dump");
        assert_eq!(json[0]["kind"], "command");
    }

    #[test]
    fn autoload_skips_failed_init_and_registers_commands() {
        let failing = Scripted {
            init_status: Some(3),
            ..Scripted::command("broken", None)
        };
        let failing_released = Arc::clone(&failing.released);
        let loader = FakeLoader::default()
            .with("a_good.so", Scripted::command("good", Some("good")))
            .with("b_broken.so", failing)
            .with("c_silent.so", Scripted::default());
        let dir = plugin_dir(&["a_good.so", "b_broken.so", "c_silent.so", "notes.txt", "d_bad.so"]);
        let mut host = PluginHost::with_loader(loader, dir.path(), ".so");
        let mut registry = CommandRegistry::<Session>::default();

        let loaded = host.autoload(None, &mut registry);

        assert_eq!(loaded, 2);
        assert_eq!(host.count(), 2);
        assert!(failing_released.load(Ordering::SeqCst));
        assert!(registry.contains("good"));
        assert!(!registry.contains("broken"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn autoload_keeps_existing_command() {
        let loader = FakeLoader::default()
            .with("one.so", Scripted::command("first", Some("dup")))
            .with("two.so", Scripted::command("second", Some("dup")));
        let dir = plugin_dir(&["one.so", "two.so"]);
        let mut host = PluginHost::with_loader(loader, dir.path(), ".so");
        let mut registry = CommandRegistry::<Session>::default();

        assert_eq!(host.autoload(None, &mut registry), 2);
        assert_eq!(registry.len(), 1);
        let entry = registry.entries().next().unwrap();
        assert_eq!(entry.description(), "first plugin");
    }

    #[test]
    fn missing_directory_loads_nothing() {
        let mut host =
            PluginHost::with_loader(FakeLoader::default(), "/nonexistent/artscope/plugins", ".so");
        let mut registry = CommandRegistry::<Session>::default();
        assert_eq!(host.autoload(None, &mut registry), 0);
    }

    #[test]
    fn registered_command_keeps_unloaded_plugin_open() {
        let scripted = Scripted::command("dumper", Some("dump"));
        let closed = Arc::clone(&scripted.closed);
        let released = Arc::clone(&scripted.released);
        let loader = FakeLoader::default().with("dump.so", scripted);
        let dir = plugin_dir(&["dump.so"]);
        let mut host = PluginHost::with_loader(loader, dir.path(), ".so");
        let mut registry = CommandRegistry::<Session>::default();
        assert_eq!(host.autoload(None, &mut registry), 1);

        assert!(host.unload("dump"));
        assert_eq!(host.count(), 0);
        assert!(registry.contains("dump"));
        assert!(!closed.load(Ordering::SeqCst));
        assert!(!released.load(Ordering::SeqCst));

        drop(registry);
        assert!(closed.load(Ordering::SeqCst));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn close_runs_when_last_handle_drops() {
        let scripted = Scripted::command("closer", None);
        let closed = Arc::clone(&scripted.closed);
        let loader = FakeLoader::default().with("closer.so", scripted);
        let mut host = PluginHost::with_loader(loader, "/plugins", ".so");

        let plugin = host.load("closer").unwrap();
        plugin.init(None).unwrap();
        assert!(host.remove(&plugin));
        assert!(!closed.load(Ordering::SeqCst));
        drop(plugin);
        assert!(closed.load(Ordering::SeqCst));
    }
}
