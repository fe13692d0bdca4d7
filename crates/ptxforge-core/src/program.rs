//! Caller-owned LLVM IR handed to the code generator.

use std::path::Path;

use crate::Result;

/// LLVM IR in textual (`.ll`) or bitcode (`.bc`) form.
///
/// The bytes are never modified; backends parse them into a private module
/// and annotate that copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateProgram {
    name: String,
    bytes: Vec<u8>,
}

impl IntermediateProgram {
    pub fn from_ir_text(name: impl Into<String>, ir: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bytes: ir.into().into_bytes(),
        }
    }

    pub fn from_bitcode(name: impl Into<String>, bitcode: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes: bitcode,
        }
    }

    /// Read a `.ll` or `.bc` file. The module is named after the file stem.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        Ok(Self { name, bytes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// LLVM bitcode starts with `BC\xC0\xDE` (or the `0x0B17C0DE` wrapper).
    pub fn is_bitcode(&self) -> bool {
        self.bytes.starts_with(b"BC\xC0\xDE") || self.bytes.starts_with(&[0xDE, 0xC0, 0x17, 0x0B])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_bitcode_detection() {
        let text = IntermediateProgram::from_ir_text("k", "define void @k() { ret void }");
        assert!(!text.is_bitcode());
        let bc = IntermediateProgram::from_bitcode("k", vec![b'B', b'C', 0xC0, 0xDE, 0x35]);
        assert!(bc.is_bitcode());
    }

    #[test]
    fn test_from_file_uses_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saxpy.ll");
        std::fs::write(&path, "; empty\n").unwrap();
        let prog = IntermediateProgram::from_file(&path).unwrap();
        assert_eq!(prog.name(), "saxpy");
        assert_eq!(prog.bytes(), b"; empty\n");
    }
}
