use std::time::Duration;
use thiserror::Error;

/// Failures of the pure price/tick layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TickMathError {
    #[error("price must be positive and finite, got {0}")]
    InvalidPrice(f64),

    #[error("tick spacing must be positive, got {0}")]
    InvalidSpacing(i32),

    #[error("range percent must be positive and finite, got {0}")]
    InvalidRangePercent(f64),

    #[error("tick range [{lower}, {upper}] violates global tick bounds")]
    RangeOutOfBounds { lower: i32, upper: i32 },
}

/// Failures at the chain / wallet execution boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("transaction submission failed: {0}")]
    Submission(String),

    #[error("confirmation not observed within {0:?}")]
    ConfirmationTimeout(Duration),

    #[error("transaction {0} reverted")]
    Reverted(String),

    #[error("insufficient {token} balance: have {available:.6}, need {required:.6}")]
    InsufficientBalance {
        token: String,
        available: f64,
        required: f64,
    },

    #[error("insufficient gas balance: have {available:.6}, need {required:.6}")]
    InsufficientGas { available: f64, required: f64 },

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

impl ExecutionError {
    /// Pre-flight failures cannot change between attempts, so they are not retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ExecutionError::InsufficientBalance { .. }
                | ExecutionError::InsufficientGas { .. }
                | ExecutionError::InvalidParams(_)
        )
    }
}

impl From<alloy_transport::TransportError> for ExecutionError {
    fn from(err: alloy_transport::TransportError) -> Self {
        ExecutionError::Rpc(err.to_string())
    }
}

impl From<alloy_sol_types::Error> for ExecutionError {
    fn from(err: alloy_sol_types::Error) -> Self {
        ExecutionError::Rpc(format!("abi decode: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preflight_errors_are_not_retryable() {
        let balance = ExecutionError::InsufficientBalance {
            token: "USDC".to_string(),
            available: 1.0,
            required: 2.0,
        };
        let gas = ExecutionError::InsufficientGas {
            available: 0.001,
            required: 0.01,
        };
        assert!(!balance.is_retryable());
        assert!(!gas.is_retryable());
        assert!(!ExecutionError::InvalidParams("zero amount".into()).is_retryable());
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(ExecutionError::Submission("nonce too low".into()).is_retryable());
        assert!(ExecutionError::ConfirmationTimeout(Duration::from_secs(300)).is_retryable());
        assert!(ExecutionError::Reverted("0xabc".into()).is_retryable());
        assert!(ExecutionError::Rpc("503".into()).is_retryable());
    }
}
