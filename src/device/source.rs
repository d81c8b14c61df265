//! Kernel source resolution.

use crate::error::{IntegratorError, IntegratorResult};
use std::path::{Path, PathBuf};

/// File name of the bundled kernel source.
pub const DEFAULT_KERNEL: &str = "azim_lut.cl";

/// Package-relative directory holding the bundled kernels.
pub fn package_kernel_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("kernels")
}

/// Resolve a kernel identifier to an existing file.
///
/// The identifier is tried as given (relative to the working directory),
/// then inside the package kernel directory.
pub fn resolve_kernel(identifier: &str) -> IntegratorResult<PathBuf> {
    let direct = PathBuf::from(identifier);
    if direct.is_file() {
        return Ok(direct);
    }

    let packaged = package_kernel_dir().join(identifier);
    if packaged.is_file() {
        return Ok(packaged);
    }

    let cwd = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|_| ".".to_string());
    Err(IntegratorError::KernelSourceNotFound {
        name: identifier.to_string(),
        searched: format!("{cwd}, {}", package_kernel_dir().display()),
    })
}

/// Kernel source text ready to be built.
#[derive(Debug, Clone)]
pub struct KernelSource {
    name: String,
    path: Option<PathBuf>,
    text: String,
}

impl KernelSource {
    /// Resolve and read a kernel source; `None` selects the bundled one.
    pub fn load(identifier: Option<&str>) -> IntegratorResult<Self> {
        let identifier = identifier.unwrap_or(DEFAULT_KERNEL);
        let path = resolve_kernel(identifier)?;
        let text = std::fs::read_to_string(&path).map_err(|e| {
            IntegratorError::KernelSourceNotFound {
                name: identifier.to_string(),
                searched: format!("{} ({e})", path.display()),
            }
        })?;
        Ok(Self {
            name: identifier.to_string(),
            path: Some(path),
            text,
        })
    }

    /// Source given directly as text.
    pub fn inline(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            text: text.into(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Names declared as `__kernel void <name>(`.
    pub fn entry_points(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut rest = self.text.as_str();
        while let Some(pos) = rest.find("__kernel") {
            rest = &rest[pos + "__kernel".len()..];
            let Some(after_void) = rest.trim_start().strip_prefix("void") else {
                continue;
            };
            let name: String = after_void
                .trim_start()
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                names.push(name);
            }
        }
        names
    }
}
