//! PTX text patching.
//!
//! LLVM emits `.version`/`.target` for the ISA and architecture it was
//! clamped to. The toolkit accepts newer values, so the directives are
//! rewritten to the requested ones after emission. Inline-asm marker
//! comments are stripped as well.

use crate::target::sm_name;
use crate::version::IsaVersion;

pub const VERSION_DIRECTIVE: &str = ".version";
pub const TARGET_DIRECTIVE: &str = ".target";
pub const INLINE_ASM_BEGIN: &str = "\t// begin inline asm";
pub const INLINE_ASM_END: &str = "\t// end inline asm";

/// Replace the first `begin` and everything up to and including the next
/// `end` with `replacement`. Without a following `end` the rest of the text
/// is replaced. Returns false (and leaves `text` alone) if `begin` is absent.
pub fn find_and_replace(text: &mut String, begin: &str, end: &str, replacement: &str) -> bool {
    let Some(start) = text.find(begin) else {
        return false;
    };
    let stop = text[start..]
        .find(end)
        .map(|offset| start + offset + end.len())
        .unwrap_or(text.len());
    text.replace_range(start..stop, replacement);
    true
}

/// Rewrite the first `.version` line to `.version <major>.<minor>`.
pub fn set_version_directive(text: &mut String, isa: IsaVersion) -> bool {
    let line = format!("{} {}\n", VERSION_DIRECTIVE, isa);
    find_and_replace(text, VERSION_DIRECTIVE, "\n", &line)
}

/// Rewrite the first `.target` line to `.target sm_<cc>`.
pub fn set_target_directive(text: &mut String, compute_capability: u32) -> bool {
    let line = format!("{} {}\n", TARGET_DIRECTIVE, sm_name(compute_capability));
    find_and_replace(text, TARGET_DIRECTIVE, "\n", &line)
}

/// Remove every inline-asm begin/end marker line. Returns how many were removed.
pub fn strip_inline_asm_markers(text: &mut String) -> usize {
    let mut removed = 0;
    for marker in [INLINE_ASM_BEGIN, INLINE_ASM_END] {
        while find_and_replace(text, marker, "\n", "") {
            removed += 1;
        }
    }
    removed
}

/// Apply every rewrite. `isa` must be the unclamped toolkit ISA and
/// `compute_capability` the requested one, not what LLVM was configured with.
pub fn postprocess(text: &mut String, isa: IsaVersion, compute_capability: u32) {
    if !set_version_directive(text, isa) {
        tracing::debug!("no {} directive to patch", VERSION_DIRECTIVE);
    }
    if !set_target_directive(text, compute_capability) {
        tracing::debug!("no {} directive to patch", TARGET_DIRECTIVE);
    }
    let removed = strip_inline_asm_markers(text);
    if removed > 0 {
        tracing::debug!("stripped {} inline asm markers", removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LLVM_PTX: &str = "//\n\
// Generated by LLVM NVPTX Back-End\n\
//\n\
\n\
.version 6.4\n\
.target sm_75\n\
.address_size 64\n\
\n\
.visible .entry add_kernel(\n\
\t.param .u64 add_kernel_param_0\n\
)\n\
{\n\
\t// begin inline asm\n\
\tmov.u32 %r1, %laneid;\n\
\t// end inline asm\n\
\tret;\n\
}\n";

    fn directive_lines(text: &str) -> (String, String) {
        let version = text.lines().find(|l| l.starts_with(".version")).unwrap().to_string();
        let target = text.lines().find(|l| l.starts_with(".target")).unwrap().to_string();
        (version, target)
    }

    #[test]
    fn test_requested_directives_override_generator() {
        let mut text = LLVM_PTX.to_string();
        postprocess(&mut text, IsaVersion::new(73), 70);
        let (version, target) = directive_lines(&text);
        assert_eq!(version, ".version 7.3");
        assert_eq!(target, ".target sm_70");
        assert!(text.contains(".address_size 64\n"));
    }

    #[test]
    fn test_target_uses_requested_capability_above_ceiling() {
        let mut text = LLVM_PTX.to_string();
        postprocess(&mut text, IsaVersion::new(72), 86);
        let (version, target) = directive_lines(&text);
        assert_eq!(version, ".version 7.2");
        assert_eq!(target, ".target sm_86");
    }

    #[test]
    fn test_only_first_directive_rewritten() {
        let mut text = ".version 6.4\n.target sm_75\n// .target sm_60\n".to_string();
        assert!(set_target_directive(&mut text, 80));
        assert_eq!(text, ".version 6.4\n.target sm_80\n// .target sm_60\n");
    }

    #[test]
    fn test_missing_markers_are_noops() {
        let mut text = "\t.reg .b32 %r<4>;\n".to_string();
        assert!(!set_version_directive(&mut text, IsaVersion::new(70)));
        assert!(!set_target_directive(&mut text, 70));
        assert_eq!(strip_inline_asm_markers(&mut text), 0);
        assert_eq!(text, "\t.reg .b32 %r<4>;\n");
    }

    #[test]
    fn test_directive_without_trailing_newline() {
        let mut text = ".version 6.4".to_string();
        assert!(set_version_directive(&mut text, IsaVersion::new(71)));
        assert_eq!(text, ".version 7.1\n");
    }

    #[test]
    fn test_two_marker_pairs_removed() {
        let mut text = String::from(
            "{\n\t// begin inline asm\n\tA;\n\t// end inline asm\n\tB;\n\t// begin inline asm\n\tC;\n\t// end inline asm\n}\n",
        );
        assert_eq!(strip_inline_asm_markers(&mut text), 4);
        assert_eq!(text, "{\n\tA;\n\tB;\n\tC;\n}\n");
    }

    #[test]
    fn test_postprocess_idempotent() {
        let mut once = LLVM_PTX.to_string();
        postprocess(&mut once, IsaVersion::new(73), 86);
        let mut twice = once.clone();
        postprocess(&mut twice, IsaVersion::new(73), 86);
        assert_eq!(once, twice);
        assert_eq!(strip_inline_asm_markers(&mut twice), 0);
        assert!(!once.contains("inline asm"));
    }
}
