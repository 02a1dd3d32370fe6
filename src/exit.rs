//! Process exit status.
//!
//! Every way the server can stop maps to one distinct code so that a
//! supervisor can tell a configuration mistake from a runtime fault.

use std::fmt;

/// Exit status recorded by the server and returned to the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    /// Stopped by `SHUTDOWN` or an interrupt.
    Clean = 0,
    /// `TCP_SERVER_PORT` was not set.
    MissingPort = 1,
    /// The configuration file could not be read or parsed.
    BadConfigFile = 2,
    /// `TCP_SERVER_PORT` was not a positive 16-bit integer.
    InvalidPort = 3,
    /// The listener failed or the accept path faulted.
    RuntimeFault = 4,
}

impl ExitStatus {
    /// Numeric process exit code.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_clean(self) -> bool {
        self == ExitStatus::Clean
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let codes = [
            ExitStatus::Clean.code(),
            ExitStatus::MissingPort.code(),
            ExitStatus::BadConfigFile.code(),
            ExitStatus::InvalidPort.code(),
            ExitStatus::RuntimeFault.code(),
        ];
        assert_eq!(codes, [0, 1, 2, 3, 4]);
        assert!(ExitStatus::Clean.is_clean());
        assert!(!ExitStatus::RuntimeFault.is_clean());
    }
}
