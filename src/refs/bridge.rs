//! The string helpers handed to the scripting side.
//!
//! Results are packaged as [`ScriptValue`]s so the embedding engine only has
//! to map three shapes onto its own value type.

use std::fmt;

use anyhow::{anyhow, Context, Result};
use jni::objects::JString;
use jni::sys::jstring;
use jni::{JNIEnv, JavaVM};

use super::decode::Decoder;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptValue {
    Nil,
    Integer(i64),
    Str(String),
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => f.write_str("nil"),
            ScriptValue::Integer(v) => write!(f, "{v:#x}"),
            ScriptValue::Str(s) => f.write_str(s),
        }
    }
}

/// Environment of the calling thread, attaching it when detached.
pub fn current_env(vm: Option<&JavaVM>) -> Result<JNIEnv<'_>> {
    let vm = vm.ok_or_else(|| anyhow!("JNIEnv not available"))?;
    match vm.get_env() {
        Ok(env) => Ok(env),
        Err(_) => vm
            .attach_current_thread_permanently()
            .context("attach current thread"),
    }
}

pub struct JniBridge<'d> {
    decoder: &'d Decoder,
}

impl<'d> JniBridge<'d> {
    pub fn new(decoder: &'d Decoder) -> Self {
        Self { decoder }
    }

    /// New Java string; yields the decoded raw address of the object.
    pub fn new_string_utf(&self, env: &mut JNIEnv<'_>, text: &str) -> Result<ScriptValue> {
        let jstr = env
            .new_string(text)
            .context("Failed to create Java String")?;
        // SAFETY: fresh local reference created on this thread's env.
        let address = unsafe { self.decoder.decode_address(env.get_raw(), jstr.as_raw()) };
        tracing::debug!(text, address = format_args!("{address:#x}"), "newStringUTF");
        Ok(ScriptValue::Integer(address as i64))
    }

    pub fn get_string_utf(&self, env: &mut JNIEnv<'_>, reference: i64) -> Result<ScriptValue> {
        if reference == 0 {
            return Ok(ScriptValue::Nil);
        }
        let text = read_string(env, reference)?;
        Ok(ScriptValue::Str(text))
    }

    /// Length in UTF-16 units, as Java reports it.
    pub fn get_string_length(&self, env: &mut JNIEnv<'_>, reference: i64) -> Result<ScriptValue> {
        if reference == 0 {
            return Ok(ScriptValue::Integer(0));
        }
        let raw = env.get_raw();
        // SAFETY: `raw` is the live env of this thread; the function table is
        // provided by the runtime.
        let length = unsafe {
            let length = (**raw)
                .GetStringLength
                .ok_or_else(|| anyhow!("GetStringLength missing from function table"))?;
            length(raw, reference as usize as jstring)
        };
        Ok(ScriptValue::Integer(i64::from(length)))
    }

    pub fn delete_global_ref(&self, env: &mut JNIEnv<'_>, reference: i64) -> Result<ScriptValue> {
        if reference == 0 {
            return Ok(ScriptValue::Nil);
        }
        let raw = env.get_raw();
        // SAFETY: `raw` is the live env of this thread; the function table is
        // provided by the runtime.
        unsafe {
            let delete = (**raw)
                .DeleteGlobalRef
                .ok_or_else(|| anyhow!("DeleteGlobalRef missing from function table"))?;
            delete(raw, reference as usize as jstring);
        }
        Ok(ScriptValue::Nil)
    }
}

fn read_string(env: &mut JNIEnv<'_>, reference: i64) -> Result<String> {
    // SAFETY: the caller hands us a string reference it obtained from the
    // runtime; wrapping it does not take ownership.
    let jstr = unsafe { JString::from_raw(reference as usize as jstring) };
    let text: String = env
        .get_string(&jstr)
        .context("Failed to get String content")?
        .into();
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    use jni::sys::{jobject, jsize, JNINativeInterface_};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAKE_STRING: usize = 0x7000_1230;

    static DELETED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "system" fn fake_length(_env: *mut jni::sys::JNIEnv, string: jstring) -> jsize {
        if string as usize == FAKE_STRING {
            11
        } else {
            -1
        }
    }

    unsafe extern "system" fn fake_delete(_env: *mut jni::sys::JNIEnv, object: jobject) {
        DELETED.store(object as usize, Ordering::SeqCst);
    }

    /// A function table with only the entries under test filled in.
    fn fake_table() -> JNINativeInterface_ {
        // SAFETY: every field is a nullable pointer or an `Option` of one.
        let mut table: JNINativeInterface_ = unsafe { std::mem::zeroed() };
        table.GetStringLength = Some(fake_length);
        table.DeleteGlobalRef = Some(fake_delete);
        table
    }

    #[test]
    fn string_length_comes_from_the_function_table() {
        let table = fake_table();
        let mut raw: jni::sys::JNIEnv = &table;
        let mut env = unsafe { JNIEnv::from_raw(&mut raw) }.unwrap();
        let decoder = Decoder::default();
        let bridge = JniBridge::new(&decoder);

        let length = bridge.get_string_length(&mut env, FAKE_STRING as i64).unwrap();
        assert_eq!(length, ScriptValue::Integer(11));
        assert_eq!(
            bridge.get_string_length(&mut env, 0).unwrap(),
            ScriptValue::Integer(0)
        );
    }

    #[test]
    fn missing_table_entry_is_an_error() {
        // SAFETY: see `fake_table`.
        let table: JNINativeInterface_ = unsafe { std::mem::zeroed() };
        let mut raw: jni::sys::JNIEnv = &table;
        let mut env = unsafe { JNIEnv::from_raw(&mut raw) }.unwrap();
        let decoder = Decoder::default();
        let bridge = JniBridge::new(&decoder);

        let err = bridge.get_string_length(&mut env, FAKE_STRING as i64).unwrap_err();
        assert!(err.to_string().contains("GetStringLength"));
    }

    #[test]
    fn global_refs_are_deleted_through_the_function_table() {
        let table = fake_table();
        let mut raw: jni::sys::JNIEnv = &table;
        let mut env = unsafe { JNIEnv::from_raw(&mut raw) }.unwrap();
        let decoder = Decoder::default();
        let bridge = JniBridge::new(&decoder);

        let result = bridge.delete_global_ref(&mut env, 0x5150).unwrap();
        assert_eq!(result, ScriptValue::Nil);
        assert_eq!(DELETED.load(Ordering::SeqCst), 0x5150);
    }

    #[test]
    fn script_values_render_for_replies() {
        assert_eq!(ScriptValue::Nil.to_string(), "nil");
        assert_eq!(ScriptValue::Integer(0x1234_5678).to_string(), "0x12345678");
        assert_eq!(ScriptValue::Str("hello".into()).to_string(), "hello");
    }

    #[test]
    fn missing_vm_reports_unavailable_env() {
        let err = current_env(None).err().expect("no vm means no env");
        assert_eq!(err.to_string(), "JNIEnv not available");
    }
}
