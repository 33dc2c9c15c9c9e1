use crate::device::Device;
use anyhow::{Result, bail};

/// Device enumeration relies on `/sys/block` and is only available on Linux.
pub fn list_block_devices() -> Result<Vec<Device>> {
    bail!("device enumeration is only supported on Linux")
}
