//! Outcome classification.
//!
//! Precedence: timeout, then crash signature, then the pass criterion
//! (expected outcome if the test has one, otherwise exit code 0).

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::model::{ExecutionResult, FailureInfo, TestCase, TestOutcome};

/// Lines of context kept on either side of a crash signature.
const EXCERPT_CONTEXT_LINES: usize = 5;

/// Output patterns that indicate a fatal kernel or process crash.
pub fn default_crash_signature_patterns() -> Vec<&'static str> {
    vec![
        r"Kernel panic - not syncing",
        r"\bBUG: ",
        r"\bOops(:| -)",
        r"general protection fault",
        r"[Uu]nable to handle kernel",
        r"\bKASAN: ",
        r"\bUBSAN: ",
        r"Call Trace:",
        r"Segmentation fault",
        r"\bAborted\b",
        r"core dumped",
        r"panicked at",
        r"watchdog: BUG: soft lockup",
        r"INFO: task .* blocked for more than",
    ]
}

static CRASH_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    default_crash_signature_patterns()
        .into_iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

/// A crash signature located in captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashMatch {
    /// Matched text.
    pub signature: String,
    /// Output around the match.
    pub excerpt: String,
}

/// Finds the earliest crash signature in `output`.
pub fn detect_crash(output: &str) -> Option<CrashMatch> {
    let found = CRASH_SIGNATURES
        .iter()
        .filter_map(|re| re.find(output))
        .min_by_key(|m| m.start())?;

    let line_no = output[..found.start()].matches('\n').count();
    let lines: Vec<&str> = output.lines().collect();
    let from = line_no.saturating_sub(EXCERPT_CONTEXT_LINES);
    let to = (line_no + EXCERPT_CONTEXT_LINES + 1).min(lines.len());

    Some(CrashMatch {
        signature: found.as_str().to_string(),
        excerpt: lines[from..to].join("\n"),
    })
}

/// Classifies a raw backend result against `test`'s pass criterion.
pub fn classify(test: &TestCase, execution: &ExecutionResult, timeout: Duration) -> TestOutcome {
    if execution.timed_out {
        return TestOutcome::Timeout(FailureInfo::timeout(timeout));
    }

    if let Some(crash) = detect_crash(&execution.combined_output()) {
        return TestOutcome::Failed(FailureInfo::crash(
            format!("Crash signature detected: {}", crash.signature),
            execution.exit_code,
            crash.excerpt,
        ));
    }

    let Some(code) = execution.exit_code else {
        return TestOutcome::Failed(FailureInfo::exit(
            "Process terminated without an exit code",
            None,
        ));
    };

    match &test.expected_outcome {
        Some(expected) => {
            if code != expected.exit_code {
                return TestOutcome::Failed(FailureInfo::exit(
                    format!("Exit code {} (expected {})", code, expected.exit_code),
                    Some(code),
                ));
            }
            if let Some(needle) = &expected.output_contains {
                if !execution.stdout.contains(needle.as_str()) {
                    return TestOutcome::Failed(FailureInfo::exit(
                        format!("Expected output not found: {needle:?}"),
                        Some(code),
                    ));
                }
            }
            TestOutcome::Passed
        }
        None if code == 0 => TestOutcome::Passed,
        None => TestOutcome::Failed(FailureInfo::exit(
            format!("Exited with code {code}"),
            Some(code),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExpectedOutcome, TestStatus, TestType};

    fn run(exit_code: Option<i32>, stdout: &str, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            ..Default::default()
        }
    }

    fn test_case() -> TestCase {
        TestCase::new("t", TestType::Unit, "true")
    }

    const T: Duration = Duration::from_secs(5);

    #[test]
    fn test_patterns_compile() {
        assert_eq!(
            CRASH_SIGNATURES.len(),
            default_crash_signature_patterns().len()
        );
    }

    #[test]
    fn test_clean_exit_passes() {
        let outcome = classify(&test_case(), &run(Some(0), "ok", ""), T);
        assert_eq!(outcome, TestOutcome::Passed);
    }

    #[test]
    fn test_nonzero_exit_fails_with_code() {
        let (status, info) = classify(&test_case(), &run(Some(3), "", "nope"), T).into_parts();
        assert_eq!(status, TestStatus::Failed);
        let info = info.unwrap();
        assert_eq!(info.exit_code, Some(3));
        assert!(!info.kernel_panic);
        assert!(!info.timeout_occurred);
    }

    #[test]
    fn test_crash_signature_beats_exit_zero() {
        let console = "booting\n[   1.2] Kernel panic - not syncing: VFS\n[   1.3] ---[ end ]---";
        let (status, info) = classify(&test_case(), &run(Some(0), console, ""), T).into_parts();
        assert_eq!(status, TestStatus::Failed);
        let info = info.unwrap();
        assert!(info.kernel_panic);
        assert!(info.stack_trace.unwrap().contains("VFS"));
    }

    #[test]
    fn test_crash_in_stderr() {
        let outcome = classify(
            &test_case(),
            &run(Some(134), "", "sh: line 1: 42 Aborted (core dumped) ./bin"),
            T,
        );
        let (_, info) = outcome.into_parts();
        assert!(info.unwrap().kernel_panic);
    }

    #[test]
    fn test_timeout_dominates() {
        let mut execution = run(None, "BUG: unable to handle page fault", "");
        execution.timed_out = true;
        let (status, info) = classify(&test_case(), &execution, T).into_parts();
        assert_eq!(status, TestStatus::Timeout);
        let info = info.unwrap();
        assert!(info.timeout_occurred);
        assert!(!info.kernel_panic);
    }

    #[test]
    fn test_killed_without_exit_code_fails() {
        let (status, info) = classify(&test_case(), &run(None, "", ""), T).into_parts();
        assert_eq!(status, TestStatus::Failed);
        assert_eq!(info.unwrap().exit_code, None);
    }

    #[test]
    fn test_expected_outcome() {
        let test = test_case().with_expected_outcome(ExpectedOutcome {
            exit_code: 1,
            output_contains: Some("EINVAL".to_string()),
        });

        assert_eq!(
            classify(&test, &run(Some(1), "write: EINVAL", ""), T),
            TestOutcome::Passed
        );
        assert_eq!(
            classify(&test, &run(Some(0), "write: EINVAL", ""), T)
                .into_parts()
                .0,
            TestStatus::Failed
        );
        assert_eq!(
            classify(&test, &run(Some(1), "ok", ""), T).into_parts().0,
            TestStatus::Failed
        );
    }

    #[test]
    fn test_detect_crash_picks_earliest() {
        let output = "a\nb\nCall Trace:\nc\nKernel panic - not syncing: x\n";
        let crash = detect_crash(output).unwrap();
        assert_eq!(crash.signature, "Call Trace:");
        assert!(detect_crash("all good\n").is_none());
    }
}
