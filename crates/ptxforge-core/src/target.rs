//! Compilation target: compute capability plus toolkit version.

use crate::driver::CudaDriver;
use crate::version::{resolve_isa_version, IsaVersion};
use crate::Result;

/// The pair (compute capability, toolkit version) a kernel is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    compute_capability: u32,
    toolkit_version: u32,
}

impl TargetDescriptor {
    /// `compute_capability` as `major * 10 + minor` (e.g. 75), `toolkit_version`
    /// in the driver encoding (e.g. 11030).
    pub const fn new(compute_capability: u32, toolkit_version: u32) -> Self {
        Self {
            compute_capability,
            toolkit_version,
        }
    }

    /// Query a device's compute capability and the installed driver version.
    pub fn detect(driver: &CudaDriver, ordinal: u32) -> Result<Self> {
        let compute_capability = driver.compute_capability(ordinal)?;
        let toolkit_version = driver.driver_version()?;
        Ok(Self::new(compute_capability, toolkit_version))
    }

    /// Same toolkit, different architecture. Lets a device be compiled for
    /// as if it were another generation.
    pub const fn interpret_as(self, compute_capability: u32) -> Self {
        Self {
            compute_capability,
            ..self
        }
    }

    pub const fn compute_capability(&self) -> u32 {
        self.compute_capability
    }

    pub const fn toolkit_version(&self) -> u32 {
        self.toolkit_version
    }

    /// `sm_<cc>` architecture name.
    pub fn sm_name(&self) -> String {
        sm_name(self.compute_capability)
    }

    /// PTX ISA version the toolkit accepts.
    pub fn isa_version(&self) -> Result<IsaVersion> {
        resolve_isa_version(self.toolkit_version)
    }
}

/// `sm_<cc>` architecture name for a compute capability.
pub fn sm_name(compute_capability: u32) -> String {
    format!("sm_{}", compute_capability)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let t = TargetDescriptor::new(86, 11030);
        assert_eq!(t.compute_capability(), 86);
        assert_eq!(t.toolkit_version(), 11030);
        assert_eq!(t.sm_name(), "sm_86");
        assert_eq!(t.isa_version().unwrap().code(), 73);
    }

    #[test]
    fn test_interpret_as_keeps_toolkit() {
        let t = TargetDescriptor::new(86, 11020).interpret_as(70);
        assert_eq!(t, TargetDescriptor::new(70, 11020));
    }

    #[test]
    fn test_old_toolkit_rejected() {
        assert!(TargetDescriptor::new(70, 9050).isa_version().is_err());
    }
}
