//! CUDA toolkit version to PTX ISA version resolution.
//!
//! Toolkit versions use the driver's integer encoding (`11030` = 11.3.0).
//! PTX ISA versions are stored as `major * 10 + minor` (`73` = 7.3).

use std::fmt;

use crate::error::ForgeError;
use crate::Result;

/// Minimum toolkit version for each PTX ISA version, newest first.
pub const ISA_TABLE: [(u32, u32); 7] = [
    (11030, 73),
    (11020, 72),
    (11010, 71),
    (11000, 70),
    (10020, 65),
    (10010, 64),
    (10000, 63),
];

/// A PTX ISA version (`.version` directive value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsaVersion(u32);

impl IsaVersion {
    pub const fn new(code: u32) -> Self {
        Self(code)
    }

    /// Encoded `major * 10 + minor` value.
    pub const fn code(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u32 {
        self.0 / 10
    }

    pub const fn minor(self) -> u32 {
        self.0 % 10
    }

    /// Lower of `self` and `ceiling`.
    pub fn clamp_to(self, ceiling: IsaVersion) -> Self {
        self.min(ceiling)
    }

    /// LLVM NVPTX subtarget feature selecting this ISA (`+ptx64`).
    pub fn feature(self) -> String {
        format!("+ptx{}", self.0)
    }
}

impl fmt::Display for IsaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Highest PTX ISA version the given toolkit accepts.
pub fn resolve_isa_version(toolkit_version: u32) -> Result<IsaVersion> {
    ISA_TABLE
        .iter()
        .find(|&&(threshold, _)| toolkit_version >= threshold)
        .map(|&(_, isa)| IsaVersion(isa))
        .ok_or(ForgeError::UnsupportedToolkitVersion {
            version: toolkit_version,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_thresholds_exact() {
        let cases = [
            (10000, 63),
            (10010, 64),
            (10020, 65),
            (11000, 70),
            (11010, 71),
            (11020, 72),
            (11030, 73),
        ];
        for (toolkit, isa) in cases {
            assert_eq!(resolve_isa_version(toolkit).unwrap().code(), isa, "toolkit {}", toolkit);
        }
    }

    #[test]
    fn test_highest_threshold_wins() {
        assert_eq!(resolve_isa_version(11029).unwrap().code(), 72);
        assert_eq!(resolve_isa_version(10999).unwrap().code(), 65);
        assert_eq!(resolve_isa_version(12040).unwrap().code(), 73);
    }

    #[test]
    fn test_below_minimum_is_unsupported() {
        for toolkit in [0, 9020, 9050, 9999] {
            match resolve_isa_version(toolkit) {
                Err(ForgeError::UnsupportedToolkitVersion { version }) => {
                    assert_eq!(version, toolkit)
                }
                other => panic!("expected UnsupportedToolkitVersion, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_table_is_ordered() {
        for pair in ISA_TABLE.windows(2) {
            assert!(pair[0].0 > pair[1].0);
            assert!(pair[0].1 > pair[1].1);
        }
    }

    #[test]
    fn test_isa_display_and_feature() {
        let isa = IsaVersion::new(73);
        assert_eq!(isa.to_string(), "7.3");
        assert_eq!((isa.major(), isa.minor()), (7, 3));
        assert_eq!(isa.clamp_to(IsaVersion::new(64)).feature(), "+ptx64");
        assert_eq!(IsaVersion::new(63).clamp_to(IsaVersion::new(64)), IsaVersion::new(63));
    }
}
