//! Host services exposed to plugins: print to the client, send a line to
//! the agent, and receive the agent's reply.
//!
//! Plugins reach them either through the function table in
//! [`PluginContext`] or through the exported `artscope_*` entry points,
//! which act on the context of the plugin call running on this thread.

use std::cell::Cell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::io::Write;
use std::net::SocketAddr;
use std::ptr;

use tracing::{debug, warn};

use crate::channel::{ChannelLock, ControlChannel};
use crate::error::Result;

pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Rust side of a plugin call: who to print to and which agent to talk to.
///
/// The first `exec` takes the channel for the rest of the plugin call, so the
/// reply picked up by `recv` belongs to this plugin's request.
pub struct HostContext<'a> {
    pub client: &'a mut dyn Write,
    pub channel: &'a ControlChannel,
    pub agent: SocketAddr,
    pub target_pid: Option<i32>,
    held: Option<ChannelLock<'a>>,
}

impl<'a> HostContext<'a> {
    pub fn new(
        client: &'a mut dyn Write,
        channel: &'a ControlChannel,
        agent: SocketAddr,
        target_pid: Option<i32>,
    ) -> Self {
        Self {
            client,
            channel,
            agent,
            target_pid,
            held: None,
        }
    }

    pub fn print(&mut self, message: &str) {
        if let Err(err) = self
            .client
            .write_all(message.as_bytes())
            .and_then(|_| self.client.flush())
        {
            warn!("plugin print failed: {err}");
        }
    }

    /// Send one line to the agent, connecting first when needed.
    pub fn exec(&mut self, command: &str) -> Result<()> {
        let channel = self.channel;
        let held = self.held.get_or_insert_with(|| channel.exclusive());
        held.ensure_connection(self.agent)?;
        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        held.send(line.as_bytes())
    }

    /// One chunk of agent reply, `None` when nothing arrived in time.
    pub fn recv(&mut self) -> Result<Option<String>> {
        let timeout = self.channel.config().plugin_receive_timeout;
        let data = match self.held.as_mut() {
            Some(held) => held.receive(timeout)?,
            None => self.channel.receive(timeout)?,
        };
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&data).into_owned()))
    }
}

/// The table handed to plugin functions.
///
/// Strings returned by `recv` are allocated with `malloc` and must be
/// released with `free` (either this table's or libc's).
#[repr(C)]
pub struct PluginContext {
    pub abi_version: u32,
    pub print: unsafe extern "C" fn(ctx: *mut PluginContext, message: *const c_char),
    pub exec: unsafe extern "C" fn(ctx: *mut PluginContext, command: *const c_char) -> c_int,
    pub recv: unsafe extern "C" fn(ctx: *mut PluginContext) -> *mut c_char,
    pub free: unsafe extern "C" fn(ptr: *mut c_char),
    host: *mut c_void,
}

impl PluginContext {
    /// Table bound to `host`. Must not outlive it.
    pub fn new(host: &mut HostContext<'_>) -> Self {
        Self {
            host: host as *mut HostContext<'_> as *mut c_void,
            ..Self::detached()
        }
    }

    /// Table with no host behind it; every service fails softly.
    pub fn detached() -> Self {
        Self {
            abi_version: PLUGIN_ABI_VERSION,
            print: host_print,
            exec: host_exec,
            recv: host_recv,
            free: host_free,
            host: ptr::null_mut(),
        }
    }
}

thread_local! {
    static ACTIVE: Cell<*mut PluginContext> = const { Cell::new(ptr::null_mut()) };
}

/// Marks `ctx` as the context of the plugin call running on this thread.
pub(crate) struct ActiveGuard {
    previous: *mut PluginContext,
}

impl ActiveGuard {
    pub(crate) fn enter(ctx: *mut PluginContext) -> Self {
        let previous = ACTIVE.with(|active| active.replace(ctx));
        Self { previous }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| active.set(self.previous));
    }
}

unsafe fn host_of<'h>(ctx: *mut PluginContext) -> Option<&'h mut HostContext<'h>> {
    let ctx = ctx.as_mut()?;
    (ctx.host as *mut HostContext<'h>).as_mut()
}

unsafe fn text_of<'s>(ptr: *const c_char) -> Option<std::borrow::Cow<'s, str>> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy())
}

unsafe extern "C" fn host_print(ctx: *mut PluginContext, message: *const c_char) {
    let (Some(host), Some(message)) = (host_of(ctx), text_of(message)) else {
        return;
    };
    host.print(&message);
}

unsafe extern "C" fn host_exec(ctx: *mut PluginContext, command: *const c_char) -> c_int {
    let (Some(host), Some(command)) = (host_of(ctx), text_of(command)) else {
        return -1;
    };
    match host.exec(&command) {
        Ok(()) => 0,
        Err(err) => {
            debug!("plugin exec failed: {err}");
            -1
        }
    }
}

unsafe extern "C" fn host_recv(ctx: *mut PluginContext) -> *mut c_char {
    let Some(host) = host_of(ctx) else {
        return ptr::null_mut();
    };
    match host.recv() {
        Ok(Some(reply)) => malloc_string(&reply),
        Ok(None) => ptr::null_mut(),
        Err(err) => {
            debug!("plugin recv failed: {err}");
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn host_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        nix::libc::free(ptr as *mut c_void);
    }
}

/// NUL-terminated copy on the C heap. Interior NULs end the string early.
fn malloc_string(text: &str) -> *mut c_char {
    let bytes = text.as_bytes();
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    // SAFETY: the allocation is len + 1 bytes and we write exactly that many.
    unsafe {
        let out = nix::libc::malloc(len + 1) as *mut u8;
        if out.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(bytes.as_ptr(), out, len);
        *out.add(len) = 0;
        out as *mut c_char
    }
}

fn active() -> *mut PluginContext {
    ACTIVE.with(|active| active.get())
}

/// Print through `ctx`, or through the active call's context when null.
///
/// # Safety
/// `ctx` must be null or a live context; `message` null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn artscope_print(ctx: *mut PluginContext, message: *const c_char) {
    let ctx = if ctx.is_null() { active() } else { ctx };
    host_print(ctx, message);
}

/// # Safety
/// `command` must be null or NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn artscope_exec(command: *const c_char) -> c_int {
    host_exec(active(), command)
}

/// # Safety
/// Only meaningful inside a plugin call.
#[no_mangle]
pub unsafe extern "C" fn artscope_recv() -> *mut c_char {
    host_recv(active())
}

/// # Safety
/// `ptr` must be null or a string returned by `artscope_recv`.
#[no_mangle]
pub unsafe extern "C" fn artscope_free(ptr: *mut c_char) {
    host_free(ptr);
}

/// Addresses of the `artscope_*` exports. Referenced from the binary so the
/// linker keeps them for plugins to bind against.
pub fn exported_helpers() -> [*const c_void; 4] {
    [
        artscope_print as *const c_void,
        artscope_exec as *const c_void,
        artscope_recv as *const c_void,
        artscope_free as *const c_void,
    ]
}
