//! Indirect reference kinds.

/// The low two bits of an indirect reference.
pub const KIND_MASK: u64 = 0x3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    /// Tag 0 is used by handle scopes and other runtime-internal references.
    Internal,
    Local,
    Global,
    WeakGlobal,
}

impl RefKind {
    pub fn of(handle: u64) -> Self {
        match handle & KIND_MASK {
            0x1 => RefKind::Local,
            0x2 => RefKind::Global,
            0x3 => RefKind::WeakGlobal,
            _ => RefKind::Internal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Internal => "internal",
            RefKind::Local => "local",
            RefKind::Global => "global",
            RefKind::WeakGlobal => "weak-global",
        }
    }
}

/// The handle with its kind bits cleared.
pub fn strip_kind(handle: u64) -> u64 {
    handle & !KIND_MASK
}
