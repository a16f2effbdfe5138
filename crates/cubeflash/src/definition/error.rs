use std::fmt::{Debug, Display};

use cubecl::server::LaunchError;

/// Error that can happen while validating or launching the attention kernels.
pub enum FlashSetupError {
    /// The head dimension is not in the supported set.
    UnsupportedHeadDim(usize),
    /// The problem description is inconsistent (shape mismatch, bad dropout
    /// probability, incompatible option combination, ...).
    InvalidProblem(String),
    /// The kernel could not be launched.
    Execution(LaunchError),
}

impl From<LaunchError> for FlashSetupError {
    fn from(value: LaunchError) -> Self {
        Self::Execution(value)
    }
}

impl Display for FlashSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlashSetupError::UnsupportedHeadDim(d) => {
                writeln!(
                    f,
                    "Unable to launch flash attention: head dim {d} is not in the supported set {:?}",
                    crate::definition::SUPPORTED_HEAD_DIMS
                )
            }
            FlashSetupError::InvalidProblem(msg) => {
                writeln!(f, "Unable to launch flash attention: {msg}")
            }
            FlashSetupError::Execution(err) => {
                writeln!(f, "Unable to execute flash attention: {err:?}")
            }
        }
    }
}

impl Debug for FlashSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
