//! Tool errors and return codes.

use std::error::Error as StdError;
use std::path::PathBuf;

use displaydoc::Display;

/// The process exit codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ReturnCode {
    Ok = 0,
    UnknownError = 1,
    ArgumentProcessingError = 2,
    UnknownToolMode = 3,
    FileNotFound = 4,
    ToolFailure = 5,
}

/// A tool error with a specific return code.
#[derive(Debug, Display)]
pub enum ToolError {
    /// {0}
    Arguments(String),

    /// Unknown tool mode "{0}"
    UnknownMode(String),

    /// Tool mode "{0}" needs manifest support, which this build does not include
    UnsupportedMode(String),

    /// File not found: {0:?}
    FileNotFound(PathBuf),

    /// {0}
    Failure(String),
}

impl ToolError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::Arguments(_) => ReturnCode::ArgumentProcessingError,
            Self::UnknownMode(_) | Self::UnsupportedMode(_) => ReturnCode::UnknownToolMode,
            Self::FileNotFound(_) => ReturnCode::FileNotFound,
            Self::Failure(_) => ReturnCode::ToolFailure,
        }
    }
}

impl StdError for ToolError {}

/// Returns the exit code for an error.
pub fn return_code(error: &anyhow::Error) -> ReturnCode {
    error
        .downcast_ref::<ToolError>()
        .map(ToolError::return_code)
        .unwrap_or(ReturnCode::UnknownError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_codes() {
        let e: anyhow::Error = ToolError::FileNotFound(PathBuf::from("/nope")).into();
        assert_eq!(ReturnCode::FileNotFound, return_code(&e));

        let e = anyhow::anyhow!("Something else");
        assert_eq!(ReturnCode::UnknownError, return_code(&e));

        assert_eq!(5, ReturnCode::ToolFailure as i32);
    }
}
