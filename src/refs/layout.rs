//! Runtime layout assumptions, kept in one place.
//!
//! Every fixed offset into an opaque runtime structure and every magic
//! address window used by the decoder lives in an [`ArtLayout`]. None of these
//! values are part of a public ABI; a new runtime build may need a new table.

use std::ops::Range;

/// Address windows a value must fall into to be taken as a heap reference by
/// the stacked-local heuristic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapWindows {
    /// Applied to each 32-bit half of the slot (compressed references).
    pub compressed: Range<u64>,
    /// Applied to the whole 64-bit slot.
    pub full: Range<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtLayout {
    pub name: &'static str,
    /// Byte offset of `Thread* self_` inside `JNIEnvExt`.
    pub env_self_offset: usize,
    pub heap: HeapWindows,
    /// Candidate manglings of `art::Thread::DecodeJObject`.
    pub decode_symbols: Vec<&'static str>,
    /// Candidate manglings of `art::Thread::DecodeGlobalJObject`.
    pub decode_global_symbols: Vec<&'static str>,
}

impl ArtLayout {
    /// Android 10 and later, 64-bit.
    pub fn android_q_lp64() -> Self {
        Self {
            name: "android-10+/lp64",
            env_self_offset: 8,
            heap: HeapWindows {
                compressed: 0x0100_0000..0x4000_0000,
                full: 0x1000_0000..0x4000_0000,
            },
            decode_symbols: vec![
                "_ZNK3art6Thread13DecodeJObjectEP8_jobject",
                "_ZN3art6Thread13DecodeJObjectEP8_jobject",
            ],
            decode_global_symbols: vec![
                "_ZNK3art6Thread19DecodeGlobalJObjectEP8_jobject",
                "_ZN3art6Thread19DecodeGlobalJObjectEP8_jobject",
            ],
        }
    }
}

impl Default for ArtLayout {
    fn default() -> Self {
        Self::android_q_lp64()
    }
}

pub const LIBART: &str = "libart.so";

pub const LIBART_PATHS: &[&str] = &[
    "/apex/com.android.art/lib64/libart.so",
    "/apex/com.android.runtime/lib64/libart.so",
];
