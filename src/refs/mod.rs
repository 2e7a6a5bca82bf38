//! JNI indirect reference decoding.
//!
//! The decoder tries, in order: the null short-circuit, a read of the local
//! reference slot, the runtime's own `DecodeJObject`, and finally hands the
//! handle back unchanged.

pub mod bridge;
mod decode;
mod kind;
pub mod layout;

pub use bridge::{current_env, JniBridge, ScriptValue};
pub use decode::{DecodeFn, DecodeTier, Decoded, Decoder, NativeDecoders};
pub use kind::{strip_kind, RefKind, KIND_MASK};
pub use layout::{ArtLayout, HeapWindows};
