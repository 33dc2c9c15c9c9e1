//! Provides platform-specific device enumeration.
//!
//! This is the presentation-side collaborator of the acquisition engine: it
//! lists candidate source devices as `(path, human size)` pairs for a
//! front-end to choose from. Probing a chosen device for existence, access
//! and capacity lives in [`crate::probe`].
//!
//! Each submodule exposes the same public API, selected with `#[cfg]` for the
//! target OS.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod other;
#[cfg(not(target_os = "linux"))]
pub use self::other::*;
