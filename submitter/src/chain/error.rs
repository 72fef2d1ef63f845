use std::time::Duration;

use ethers::providers::{ProviderError, RpcError};
use ethers::types::Bytes;
use tracing::{info, trace, warn};

use super::{ETH_CALL, ETH_SEND_RAW_TRANSACTION};

pub type ChainResult<T> = Result<T, ChainCommunicationError>;

/// Failure talking to a chain node.
///
/// `Clone` so that a single in-flight request can hand its result to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainCommunicationError {
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        code: i64,
        message: String,
        data: Option<Bytes>,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to decode response: {0}")]
    Decode(String),
    #[error("Latest block has no base fee")]
    MissingBaseFee,
    #[error("All providers failed. (Errors: {0:?})")]
    AllProvidersFailed(Vec<ChainCommunicationError>),
}

impl ChainCommunicationError {
    fn normalized_message(&self) -> Option<String> {
        match self {
            Self::JsonRpc { message, .. } => Some(message.to_ascii_lowercase().replace('_', " ")),
            _ => None,
        }
    }

    fn message_contains(&self, needle: &str) -> bool {
        self.normalized_message()
            .map(|m| m.contains(needle))
            .unwrap_or(false)
    }

    /// Revert data carried by an `eth_call` or gas estimation failure, if the
    /// node reported a revert. Reverts without data yield empty bytes.
    pub fn revert_data(&self) -> Option<Bytes> {
        match self {
            Self::JsonRpc { data: Some(data), .. } => Some(data.clone()),
            Self::JsonRpc { code, .. } if *code == 3 || self.message_contains("revert") => {
                Some(Bytes::new())
            }
            _ => None,
        }
    }

    pub fn is_nonce_too_low(&self) -> bool {
        self.message_contains("nonce too low") || self.message_contains("nonce is too low")
    }

    pub fn is_underpriced(&self) -> bool {
        self.message_contains("underpriced")
    }

    pub fn is_already_known(&self) -> bool {
        self.message_contains("already known") || self.message_contains("known transaction")
    }

    pub fn is_insufficient_funds(&self) -> bool {
        self.message_contains("insufficient funds") || self.message_contains("insufficient balance")
    }

    fn is_rate_limit(&self) -> bool {
        match self {
            Self::JsonRpc { code, .. } if *code == 429 => true,
            Self::Transport(msg) => msg.contains("429"),
            _ => {
                self.message_contains("429")
                    || self.message_contains("rate limit")
                    || self.message_contains("too many requests")
            }
        }
    }
}

impl From<ProviderError> for ChainCommunicationError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::JsonRpcClientError(inner) => match inner.as_error_response() {
                Some(resp) => Self::JsonRpc {
                    code: resp.code,
                    message: resp.message.clone(),
                    data: resp.as_revert_data(),
                },
                None => Self::Transport(inner.to_string()),
            },
            ProviderError::SerdeJson(e) => Self::Decode(e.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// How a failed request should be handled by the fallback provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The node told us something true about the request; asking another node
    /// will not change the answer.
    NonRetryable,
    /// Retryable, but the node asked us to back off
    RateLimited,
    /// The node itself is (probably) unhealthy
    Retryable,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NonRetryable => "non_retryable",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Retryable => "retryable",
        }
    }
}

const METHODS_TO_NOT_RETRY_ON_REVERT: &[&str] = &[ETH_CALL, ETH_SEND_RAW_TRANSACTION];
const METHODS_TO_NOT_RETRY_ON_NONCE_ERROR: &[&str] = &[ETH_SEND_RAW_TRANSACTION];
const METHODS_TO_NOT_RETRY_ON_ALREADY_KNOWN: &[&str] = &[ETH_SEND_RAW_TRANSACTION];
const METHODS_TO_NOT_RETRY_ON_UNDERPRICED: &[&str] = &[ETH_SEND_RAW_TRANSACTION];
const METHODS_TO_NOT_RETRY_ON_INSUFFICIENT_FUNDS: &[&str] = &[ETH_SEND_RAW_TRANSACTION];

/// Figure out whether a failed request is worth sending to another provider.
///
/// Caller is responsible for adding a log span with additional context.
pub fn categorize_error(method: &str, err: &ChainCommunicationError) -> ErrorCategory {
    use ChainCommunicationError::*;
    use ErrorCategory::*;

    match err {
        AllProvidersFailed(_) => NonRetryable,
        Transport(_) | Timeout(_) | Decode(_) | MissingBaseFee => {
            if err.is_rate_limit() {
                info!(error=%err, method, "Rate limited by provider");
                RateLimited
            } else {
                warn!(error=%err, method, "Retryable transport error");
                Retryable
            }
        }
        JsonRpc { .. } => {
            if err.is_rate_limit() {
                info!(error=%err, method, "Received rate limit JsonRpcError");
                RateLimited
            } else if (METHODS_TO_NOT_RETRY_ON_REVERT.contains(&method)
                && err.revert_data().is_some())
                || (METHODS_TO_NOT_RETRY_ON_NONCE_ERROR.contains(&method)
                    && err.message_contains("nonce"))
                || (METHODS_TO_NOT_RETRY_ON_ALREADY_KNOWN.contains(&method)
                    && err.is_already_known())
                || (METHODS_TO_NOT_RETRY_ON_UNDERPRICED.contains(&method) && err.is_underpriced())
                || (METHODS_TO_NOT_RETRY_ON_INSUFFICIENT_FUNDS.contains(&method)
                    && err.is_insufficient_funds())
            {
                trace!(error=%err, method, "Non-retryable JsonRpcError");
                NonRetryable
            } else {
                warn!(error=%err, method, "Retryable JsonRpcError");
                Retryable
            }
        }
    }
}
