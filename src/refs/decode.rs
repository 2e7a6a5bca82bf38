use std::ffi::c_void;
use std::sync::OnceLock;

use jni::sys::{jobject, JNIEnv};
use tracing::{debug, info};

use super::kind::{strip_kind, RefKind};
use super::layout::{ArtLayout, LIBART, LIBART_PATHS};
use crate::symbols::Resolver;

/// `art::Thread::DecodeJObject(jobject) const` and its global sibling.
pub type DecodeFn = unsafe extern "C" fn(thread: *mut c_void, obj: jobject) -> *mut c_void;

/// Runtime decode functions found in libart.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeDecoders {
    pub local: Option<DecodeFn>,
    pub global: Option<DecodeFn>,
}

impl NativeDecoders {
    pub fn resolve(resolver: &Resolver, layout: &ArtLayout) -> Self {
        let local = resolver
            .resolve(LIBART, &layout.decode_symbols)
            .map(|sym| sym.address);
        let global = resolver
            .resolve(LIBART, &layout.decode_global_symbols)
            .map(|sym| sym.address);

        if local.is_none() && global.is_none() {
            info!("no DecodeJObject functions found");
        }

        // SAFETY: addresses come from libart's dynamic symbol table for functions
        // with the `DecodeFn` signature.
        unsafe {
            Self {
                local: local.map(|addr| std::mem::transmute::<usize, DecodeFn>(addr as usize)),
                global: global.map(|addr| std::mem::transmute::<usize, DecodeFn>(addr as usize)),
            }
        }
    }

    /// Global handles prefer the global variant; either side falls back to
    /// the other when only one was found.
    fn for_kind(&self, kind: RefKind) -> Option<DecodeFn> {
        match kind {
            RefKind::Global | RefKind::WeakGlobal => self.global.or(self.local),
            RefKind::Local | RefKind::Internal => self.local.or(self.global),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.global.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeTier {
    StackedLocal,
    Native,
    /// The handle itself, handed back unchanged.
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub address: u64,
    pub tier: DecodeTier,
}

/// Converts JNI indirect references into raw object addresses, best effort.
pub struct Decoder {
    layout: ArtLayout,
    resolver: Resolver,
    native: OnceLock<NativeDecoders>,
}

impl Decoder {
    pub fn new(layout: ArtLayout) -> Self {
        Self::with_resolver(
            layout,
            Resolver::new().with_fallback_paths(LIBART_PATHS.iter().copied()),
        )
    }

    pub fn with_resolver(layout: ArtLayout, resolver: Resolver) -> Self {
        Self {
            layout,
            resolver,
            native: OnceLock::new(),
        }
    }

    /// A decoder whose native tier is fixed up front instead of looked up in libart.
    pub fn with_native(layout: ArtLayout, native: NativeDecoders) -> Self {
        let decoder = Self::new(layout);
        let _ = decoder.native.set(native);
        decoder
    }

    pub fn layout(&self) -> &ArtLayout {
        &self.layout
    }

    /// Looked up on first use, once per decoder, whatever the outcome.
    pub fn native(&self) -> &NativeDecoders {
        self.native
            .get_or_init(|| NativeDecoders::resolve(&self.resolver, &self.layout))
    }

    /// Decode `handle`; `None` only for the null handle.
    ///
    /// # Safety
    /// Must run on a thread attached to the runtime. `env` must be null or the
    /// calling thread's `JNIEnv`. A local `handle` must be a live reference of
    /// the current frame, since its slot is read directly.
    pub unsafe fn decode(&self, env: *mut JNIEnv, handle: jobject) -> Option<Decoded> {
        let value = handle as usize as u64;
        if value == 0 {
            return None;
        }
        let kind = RefKind::of(value);
        debug!(handle = format_args!("{value:#x}"), kind = kind.as_str(), "decode reference");

        if kind == RefKind::Local {
            if let Some(address) = self.stacked_local(value) {
                debug!(address = format_args!("{address:#x}"), "stacked local decode succeeded");
                return Some(Decoded {
                    address,
                    tier: DecodeTier::StackedLocal,
                });
            }
        }

        if let Some(address) = self.native_decode(env, handle, kind) {
            debug!(address = format_args!("{address:#x}"), "DecodeJObject succeeded");
            return Some(Decoded {
                address,
                tier: DecodeTier::Native,
            });
        }

        debug!(handle = format_args!("{value:#x}"), "returning reference as fallback");
        Some(Decoded {
            address: value,
            tier: DecodeTier::Fallback,
        })
    }

    /// Like [`Decoder::decode`] with null mapped to 0.
    ///
    /// # Safety
    /// Same contract as [`Decoder::decode`].
    pub unsafe fn decode_address(&self, env: *mut JNIEnv, handle: jobject) -> u64 {
        self.decode(env, handle).map_or(0, |d| d.address)
    }

    /// Read the slot a local reference points at and look for a heap address.
    unsafe fn stacked_local(&self, handle: u64) -> Option<u64> {
        let slot = strip_kind(handle);
        if slot == 0 {
            return None;
        }
        let word = std::ptr::read_unaligned(slot as usize as *const u64);
        debug!(
            slot = format_args!("{slot:#x}"),
            word = format_args!("{word:#x}"),
            "read local reference slot"
        );
        self.classify_slot(word)
    }

    /// The low half, then the high half, then the whole word.
    pub fn classify_slot(&self, word: u64) -> Option<u64> {
        let heap = &self.layout.heap;
        let lower = word & 0xffff_ffff;
        let upper = word >> 32;
        [lower, upper]
            .into_iter()
            .find(|half| heap.compressed.contains(half))
            .or_else(|| heap.full.contains(&word).then_some(word))
    }

    unsafe fn native_decode(&self, env: *mut JNIEnv, handle: jobject, kind: RefKind) -> Option<u64> {
        let decode = self.native().for_kind(kind)?;
        let thread = self.thread_of(env);
        if thread.is_null() {
            return None;
        }
        let raw = decode(thread, handle);
        (!raw.is_null()).then_some(raw as usize as u64)
    }

    /// `JNIEnvExt::self_`.
    unsafe fn thread_of(&self, env: *mut JNIEnv) -> *mut c_void {
        if env.is_null() {
            return std::ptr::null_mut();
        }
        let field = (env as *const u8).add(self.layout.env_self_offset) as *const *mut c_void;
        std::ptr::read_unaligned(field)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(ArtLayout::default())
    }
}
