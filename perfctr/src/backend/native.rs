//! Model specific register access through the Linux `msr` driver.
//!
//! Each CPU's MSRs are exposed as `/dev/cpu/N/msr`, where the file offset is
//! the MSR address. Reads and writes happen on whatever CPU owns the file,
//! regardless of where the calling thread runs.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use super::{Backend, RegisterAccess};
use crate::topology::{CpuId, CpuTopology, TopologyOptions};

pub struct MsrDevice {
    file: File,
    cpu: CpuId,
}

impl MsrDevice {
    /// Opens the MSR device of `cpu` for reading and writing.
    ///
    /// # Safety
    ///
    /// Writing model specific registers can hang or corrupt the machine.
    /// The caller must own the performance counters of `cpu` and must only
    /// write registers that belong to them.
    pub unsafe fn open(cpu: CpuId) -> io::Result<MsrDevice> {
        let path = format!("/dev/cpu/{}/msr", cpu);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!("MsrDevice::open: opened {}", path);
        Ok(MsrDevice { file, cpu })
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl RegisterAccess for MsrDevice {
    fn read(&self, reg: u32) -> u64 {
        let mut buf = [0u8; 8];
        match self.file.read_exact_at(&mut buf, u64::from(reg)) {
            Ok(()) => u64::from_le_bytes(buf),
            Err(e) => {
                error!(
                    "MsrDevice::read: cpu {} msr {:#x} failed: {}",
                    self.cpu, reg, e
                );
                0
            }
        }
    }

    fn write(&self, reg: u32, value: u64) {
        if let Err(e) = self.file.write_all_at(&value.to_le_bytes(), u64::from(reg)) {
            error!(
                "MsrDevice::write: cpu {} msr {:#x} <- {:#x} failed: {}",
                self.cpu, reg, value, e
            );
        }
    }
}

/// Builds a topology whose CPUs are driven through their MSR devices.
///
/// # Safety
///
/// See [`MsrDevice::open`]. The backend must match the processor.
pub unsafe fn msr_topology(
    backend: Arc<dyn Backend>,
    options: TopologyOptions,
) -> io::Result<Arc<CpuTopology>> {
    let mut devices = Vec::with_capacity(options.nr_cpus);
    for cpu in 0..options.nr_cpus {
        devices.push(MsrDevice::open(cpu)?);
    }
    let registers = devices
        .into_iter()
        .map(|device| Box::new(device) as Box<dyn RegisterAccess>)
        .collect();
    Ok(Arc::new(CpuTopology::from_registers(
        backend,
        options.reload_policy,
        registers,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cpu_is_an_error() {
        let result = unsafe { MsrDevice::open(usize::MAX) };
        assert!(result.is_err());
    }
}
