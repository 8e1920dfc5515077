//! Backend selection rules.
//!
//! | environment | test type                       | backend                    |
//! |-------------|---------------------------------|----------------------------|
//! | physical    | any                             | `Physical`                 |
//! | virtual     | unit                            | `Container`                |
//! | virtual     | integration                     | `Container`, or `VirtualMachine` if kernel-level |
//! | virtual     | performance / security / fuzz   | `VirtualMachine`           |
//!
//! An integration test is kernel-level when its description or subsystem
//! matches a kernel keyword, its script matches a privileged command, or it
//! requires peripherals.

use std::sync::LazyLock;

use regex::Regex;

use crate::environment::HardwareProfile;
use crate::model::{TestCase, TestType};

use super::BackendKind;

/// Keywords in a description or subsystem that indicate kernel-level work.
pub fn default_kernel_keyword_patterns() -> Vec<&'static str> {
    vec![
        r"(?i)\bkernel\b",
        r"(?i)\bmodules?\b",
        r"(?i)\bdrivers?\b",
        r"(?i)\bsyscalls?\b",
        r"(?i)\b(irq|interrupts?)\b",
        r"(?i)\bschedul(er|ing)\b",
        r"(?i)\b(mm|memory management|page allocator)\b",
        r"(?i)\b(vfs|filesystems?|block layer)\b",
        r"(?i)\bboot\b",
        r"(?i)\b(kprobes?|ftrace|ebpf|bpf)\b",
        r"(?i)\b(panic|oops)\b",
    ]
}

/// Script fragments that need a real kernel and root privileges.
pub fn default_privileged_command_patterns() -> Vec<&'static str> {
    vec![
        r"\b(insmod|rmmod|modprobe)\b",
        r"\bsysctl\s+-w\b",
        r"\bkexec\b",
        r"\bmount\s",
        r"\bumount\b",
        r"\bdmesg\b",
        r">\s*/(proc|sys)/",
        r"/dev/(mem|kmsg|port)\b",
        r"\bchroot\b",
        r"\bsetcap\b",
    ]
}

static KERNEL_KEYWORDS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(default_kernel_keyword_patterns()));

static PRIVILEGED_COMMANDS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(default_privileged_command_patterns()));

fn compile(patterns: Vec<&'static str>) -> Vec<Regex> {
    patterns
        .into_iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}

/// Picks the backend kind for running `test` on hardware `profile`.
///
/// Deterministic and side-effect free.
pub fn select_backend(test: &TestCase, profile: &HardwareProfile) -> BackendKind {
    if !profile.is_virtual {
        return BackendKind::Physical;
    }

    match test.test_type {
        TestType::Unit => BackendKind::Container,
        TestType::Integration => {
            if is_kernel_level(test) {
                BackendKind::VirtualMachine
            } else {
                BackendKind::Container
            }
        }
        TestType::Performance | TestType::Security | TestType::Fuzz => {
            BackendKind::VirtualMachine
        }
    }
}

/// Returns true if the test signals kernel-level operation.
pub fn is_kernel_level(test: &TestCase) -> bool {
    if !test.required_hardware.peripherals.is_empty() {
        return true;
    }

    let text = format!("{} {}", test.description, test.target_subsystem);
    if KERNEL_KEYWORDS.iter().any(|re| re.is_match(&text)) {
        return true;
    }

    PRIVILEGED_COMMANDS.iter().any(|re| re.is_match(&test.script))
}
