//! Setup status of an integrator.

use crate::error::{IntegratorError, IntegratorResult};
use bitflags::bitflags;

bitflags! {
    /// Completed setup steps and enabled corrections.
    ///
    /// Bit positions follow the historical status word, context in bit 0
    /// and dummy in bit 8.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u32 {
        const CONTEXT_READY = 1 << 0;
        const SIZED = 1 << 1;
        const KERNELS_COMPILED = 1 << 2;
        const RANGE_SET = 1 << 3;
        const GEOMETRY_LOADED = 1 << 4;
        const SOLID_ANGLE = 1 << 5;
        const DARK = 1 << 6;
        const MASK = 1 << 7;
        const DUMMY = 1 << 8;
    }
}

impl StatusFlags {
    /// Steps that must all be complete before `execute`, in setup order.
    pub const EXECUTE_PREREQUISITES: [(StatusFlags, &'static str); 4] = [
        (StatusFlags::CONTEXT_READY, "context_ready"),
        (StatusFlags::SIZED, "sized"),
        (StatusFlags::KERNELS_COMPILED, "kernels_compiled"),
        (StatusFlags::GEOMETRY_LOADED, "geometry_loaded"),
    ];

    /// Every flag with its name, most significant first.
    pub fn named(&self) -> [(&'static str, bool); 9] {
        [
            ("dummy", self.contains(StatusFlags::DUMMY)),
            ("mask", self.contains(StatusFlags::MASK)),
            ("dark", self.contains(StatusFlags::DARK)),
            ("solid_angle", self.contains(StatusFlags::SOLID_ANGLE)),
            ("geometry_loaded", self.contains(StatusFlags::GEOMETRY_LOADED)),
            ("range_set", self.contains(StatusFlags::RANGE_SET)),
            ("kernels_compiled", self.contains(StatusFlags::KERNELS_COMPILED)),
            ("sized", self.contains(StatusFlags::SIZED)),
            ("context_ready", self.contains(StatusFlags::CONTEXT_READY)),
        ]
    }
}

/// Tracks which setup steps completed.
#[derive(Debug, Default)]
pub struct StatusTracker {
    flags: StatusFlags,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn flags(&self) -> StatusFlags {
        self.flags
    }

    #[inline]
    pub fn contains(&self, flag: StatusFlags) -> bool {
        self.flags.contains(flag)
    }

    #[inline]
    pub fn set(&mut self, flag: StatusFlags) {
        self.flags.insert(flag);
    }

    #[inline]
    pub fn clear(&mut self, flag: StatusFlags) {
        self.flags.remove(flag);
    }

    #[inline]
    pub fn assign(&mut self, flag: StatusFlags, value: bool) {
        self.flags.set(flag, value);
    }

    /// Fail with the first missing step among `required`.
    pub fn require(&self, required: &[(StatusFlags, &'static str)]) -> IntegratorResult<()> {
        match required.iter().find(|(flag, _)| !self.flags.contains(*flag)) {
            Some((_, missing)) => Err(IntegratorError::NotConfigured { missing }),
            None => Ok(()),
        }
    }

    pub fn require_ready(&self) -> IntegratorResult<()> {
        self.require(&StatusFlags::EXECUTE_PREREQUISITES)
    }

    /// Back to the cleaned state, optionally keeping the context.
    pub fn reset(&mut self, keep_context: bool) {
        self.flags = if keep_context {
            self.flags & StatusFlags::CONTEXT_READY
        } else {
            StatusFlags::empty()
        };
    }
}
