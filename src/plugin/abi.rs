//! The C ABI a plugin library exports.
//!
//! A plugin exports four symbols:
//!
//! ```c
//! PluginInfo artscope_plugin_info = { "name", "author", "1.0", "desc", "cmd", PLUGIN_COMMAND };
//! int  artscope_plugin_init(PluginContext* ctx);              /* ctx may be NULL */
//! void artscope_plugin_close(PluginContext* ctx);             /* ctx may be NULL */
//! int  artscope_plugin_exec(PluginContext* ctx, char* input); /* input may be NULL */
//! ```
//!
//! Zero means success for `init` and `exec`. Any export may be missing.

use std::ffi::{c_char, c_int, CStr};

use serde::Serialize;

use super::context::PluginContext;

pub const SYM_INFO: &[u8] = b"artscope_plugin_info\0";
pub const SYM_INIT: &[u8] = b"artscope_plugin_init\0";
pub const SYM_CLOSE: &[u8] = b"artscope_plugin_close\0";
pub const SYM_EXEC: &[u8] = b"artscope_plugin_exec\0";

pub type InitFn = unsafe extern "C" fn(ctx: *mut PluginContext) -> c_int;
pub type CloseFn = unsafe extern "C" fn(ctx: *mut PluginContext);
pub type ExecFn = unsafe extern "C" fn(ctx: *mut PluginContext, input: *mut c_char) -> c_int;

#[repr(C)]
pub struct RawMetadata {
    pub name: *const c_char,
    pub author: *const c_char,
    pub version: *const c_char,
    pub description: *const c_char,
    /// Command prefix, e.g. `"test"` for `test <args>`.
    pub command: *const c_char,
    pub kind: c_int,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Script,
    Native,
    Command,
    Unknown,
}

impl From<c_int> for PluginKind {
    fn from(raw: c_int) -> Self {
        match raw {
            0 => PluginKind::Script,
            1 => PluginKind::Native,
            2 => PluginKind::Command,
            _ => PluginKind::Unknown,
        }
    }
}

/// Owned copy of a plugin's metadata record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PluginMetadata {
    pub name: Option<String>,
    pub author: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub command: Option<String>,
    pub kind: Option<PluginKind>,
}

impl PluginMetadata {
    /// Copy a record out of the library.
    ///
    /// # Safety
    /// `raw` must be null or point at a `RawMetadata` whose string fields are
    /// null or NUL-terminated.
    pub unsafe fn from_raw(raw: *const RawMetadata) -> Option<Self> {
        let raw = raw.as_ref()?;
        Some(Self {
            name: owned(raw.name),
            author: owned(raw.author),
            version: owned(raw.version),
            description: owned(raw.description),
            command: owned(raw.command),
            kind: Some(PluginKind::from(raw.kind)),
        })
    }

    /// The name a plugin's command is registered under.
    pub fn command_name(&self) -> Option<&str> {
        self.command.as_deref().or(self.name.as_deref())
    }
}

unsafe fn owned(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_copies_strings_and_tolerates_nulls() {
        let raw = RawMetadata {
            name: c"test_plugin".as_ptr(),
            author: std::ptr::null(),
            version: c"1.0.0".as_ptr(),
            description: c"Test plugin".as_ptr(),
            command: c"test".as_ptr(),
            kind: 2,
        };
        let meta = unsafe { PluginMetadata::from_raw(&raw) }.unwrap();
        assert_eq!(meta.name.as_deref(), Some("test_plugin"));
        assert_eq!(meta.author, None);
        assert_eq!(meta.command_name(), Some("test"));
        assert_eq!(meta.kind, Some(PluginKind::Command));

        assert_eq!(unsafe { PluginMetadata::from_raw(std::ptr::null()) }, None);
    }

    #[test]
    fn command_name_falls_back_to_plugin_name() {
        let meta = PluginMetadata {
            name: Some("dumper".into()),
            ..PluginMetadata::default()
        };
        assert_eq!(meta.command_name(), Some("dumper"));
    }

    #[test]
    fn kind_tags() {
        assert_eq!(PluginKind::from(0), PluginKind::Script);
        assert_eq!(PluginKind::from(1), PluginKind::Native);
        assert_eq!(PluginKind::from(7), PluginKind::Unknown);
        assert_eq!(
            serde_json::to_string(&PluginKind::Command).unwrap(),
            "\"command\""
        );
    }
}
