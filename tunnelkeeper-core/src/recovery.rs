//! Fault classification for automatic proxy recovery.

use std::fmt;

/// Why a background task ended.
///
/// Launchers report this directly when they know it (exit codes, spawn errors);
/// [`Fault::classify`] covers faults that only arrive as text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    ConnectionRefused,
    ExecutableMissing,
    ExitedNonZero(i32),
    /// The task was stopped on purpose
    Stopped,
    Other(String),
}

impl Fault {
    pub fn classify(text: &str) -> Fault {
        let lower = text.to_lowercase();
        if lower.contains("stopping") || lower.contains("stopped") {
            Fault::Stopped
        } else if lower.contains("connection refused") {
            Fault::ConnectionRefused
        } else if lower.contains("executable file not found")
            || lower.contains("command not found")
            || lower.contains("no such file or directory")
        {
            Fault::ExecutableMissing
        } else if let Some(code) = exit_code_in(&lower) {
            Fault::ExitedNonZero(code)
        } else {
            Fault::Other(text.to_string())
        }
    }

    /// Faults worth one automatic restart.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Fault::ConnectionRefused | Fault::ExecutableMissing => true,
            Fault::ExitedNonZero(code) => *code != 0,
            Fault::Stopped | Fault::Other(_) => false,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::ConnectionRefused => write!(f, "connection refused"),
            Fault::ExecutableMissing => write!(f, "executable not found"),
            Fault::ExitedNonZero(code) => write!(f, "exited with code {}", code),
            Fault::Stopped => write!(f, "stopped"),
            Fault::Other(text) => write!(f, "{}", text),
        }
    }
}

/// Picks the first integer after "exit status" / "exit code" / "exited with code".
fn exit_code_in(lower: &str) -> Option<i32> {
    ["exit status", "exit code", "exited with code"]
        .iter()
        .find_map(|marker| {
            let rest = &lower[lower.find(marker)? + marker.len()..];
            let digits: String = rest
                .trim_start_matches([' ', ':'])
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '-')
                .collect();
            digits.parse().ok()
        })
        .filter(|code| *code != 0)
}

/// Whether a proxy that reported `status` with `error` should be restarted.
///
/// An intentional stop never recovers, whatever the error text says.
pub fn should_recover(status: &str, error: &str) -> bool {
    recovery_wanted(status, &Fault::classify(error))
}

/// Structured form of [`should_recover`] for faults reported by a launcher.
pub fn recovery_wanted(status: &str, fault: &Fault) -> bool {
    !matches!(Fault::classify(status), Fault::Stopped) && fault.is_recoverable()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_refused_recovers() {
        assert!(should_recover("error", "connection refused"));
        assert!(should_recover(
            "failed",
            "dial tcp 127.0.0.1:9090: connect: Connection refused"
        ));
    }

    #[test]
    fn test_stopping_never_recovers() {
        assert!(!should_recover("stopping", "connection refused"));
        assert!(!should_recover("Stopped by operator", "exit status 1"));
    }

    #[test]
    fn test_classify_exit_codes() {
        assert_eq!(Fault::classify("exit status 2"), Fault::ExitedNonZero(2));
        assert_eq!(
            Fault::classify("process exited with code: 137"),
            Fault::ExitedNonZero(137)
        );
        assert!(matches!(Fault::classify("exit status 0"), Fault::Other(_)));
    }

    #[test]
    fn test_classify_missing_executable() {
        assert_eq!(
            Fault::classify("exec: \"promxy\": executable file not found in $PATH"),
            Fault::ExecutableMissing
        );
        assert!(Fault::ExecutableMissing.is_recoverable());
    }

    #[test]
    fn test_structured_fault_respects_stop_status() {
        assert!(recovery_wanted("failed", &Fault::ExitedNonZero(1)));
        assert!(!recovery_wanted("stopped", &Fault::ExitedNonZero(1)));
    }

    #[test]
    fn test_other_errors_do_not_recover() {
        assert!(!should_recover("error", "permission denied"));
        assert!(!Fault::Other("x".into()).is_recoverable());
        assert!(!Fault::Stopped.is_recoverable());
    }
}
