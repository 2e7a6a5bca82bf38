use std::ffi::c_char;
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;
use tracing::debug;

use super::abi::{
    CloseFn, ExecFn, InitFn, PluginMetadata, RawMetadata, SYM_CLOSE, SYM_EXEC, SYM_INFO,
    SYM_INIT,
};
use super::context::{ActiveGuard, HostContext, PluginContext};
use super::{Extension, Loader};
use crate::error::{ArtscopeError, Result};

/// A plugin library opened through the platform loader.
///
/// Exports are looked up once at open time. Dropping the value closes the
/// library.
pub struct NativePlugin {
    path: PathBuf,
    metadata: Option<PluginMetadata>,
    init: Option<InitFn>,
    close: Option<CloseFn>,
    exec: Option<ExecFn>,
    // Declared last so the function pointers above never outlive it.
    _library: Library,
}

impl NativePlugin {
    pub fn open(path: &Path) -> Result<Self> {
        let library = open_library(path).map_err(|err| ArtscopeError::PluginLoad {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;

        // SAFETY: symbol types follow the plugin ABI in `abi`.
        let (metadata, init, close, exec) = unsafe {
            let metadata = library
                .get::<*const RawMetadata>(SYM_INFO)
                .ok()
                .and_then(|sym| PluginMetadata::from_raw(*sym));
            let init = library.get::<InitFn>(SYM_INIT).ok().map(|sym| *sym);
            let close = library.get::<CloseFn>(SYM_CLOSE).ok().map(|sym| *sym);
            let exec = library.get::<ExecFn>(SYM_EXEC).ok().map(|sym| *sym);
            (metadata, init, close, exec)
        };

        debug!(
            path = %path.display(),
            has_info = metadata.is_some(),
            has_init = init.is_some(),
            has_exec = exec.is_some(),
            "opened plugin library"
        );

        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            init,
            close,
            exec,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Imports are bound at load time, so a plugin calling a helper the host does
/// not provide is refused here instead of failing on its first call.
fn open_library(path: &Path) -> std::result::Result<Library, libloading::Error> {
    // SAFETY: loading runs the library's initialisers; plugins are trusted
    // code placed in the plugin directory by the operator.
    #[cfg(unix)]
    unsafe {
        use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};
        UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL).map(Library::from)
    }
    #[cfg(not(unix))]
    unsafe {
        Library::new(path)
    }
}

fn table(ctx: Option<&mut HostContext<'_>>) -> PluginContext {
    match ctx {
        Some(host) => PluginContext::new(host),
        None => PluginContext::detached(),
    }
}

impl Extension for NativePlugin {
    fn metadata(&self) -> Option<&PluginMetadata> {
        self.metadata.as_ref()
    }

    fn has_exec(&self) -> bool {
        self.exec.is_some()
    }

    fn init(&self, ctx: Option<&mut HostContext<'_>>) -> Option<i32> {
        let init = self.init?;
        let mut table = table(ctx);
        let _active = ActiveGuard::enter(&mut table);
        // SAFETY: `table` outlives the call.
        Some(unsafe { init(&mut table) })
    }

    fn exec(&self, ctx: &mut HostContext<'_>, input: Option<&str>) -> Option<i32> {
        let exec = self.exec?;
        let mut table = PluginContext::new(ctx);
        let _active = ActiveGuard::enter(&mut table);
        // Plugins may tokenize the buffer in place, so hand over an owned copy.
        let mut input = input.map(|text| {
            let mut buf = text.replace('\0', "").into_bytes();
            buf.push(0);
            buf
        });
        let raw = match input.as_mut() {
            Some(buf) => buf.as_mut_ptr() as *mut c_char,
            None => ptr::null_mut(),
        };
        // SAFETY: `table` and `input` outlive the call.
        Some(unsafe { exec(&mut table, raw) })
    }

    fn close(&self, ctx: Option<&mut HostContext<'_>>) {
        if let Some(close) = self.close {
            let mut table = table(ctx);
            let _active = ActiveGuard::enter(&mut table);
            // SAFETY: `table` outlives the call.
            unsafe { close(&mut table) };
        }
    }
}

/// Opens plugins with the platform dynamic loader.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeLoader;

impl Loader for NativeLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Extension>> {
        Ok(Box::new(NativePlugin::open(path)?))
    }
}
