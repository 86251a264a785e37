//! Outbound action trait for collaborators run through the gate.

use async_trait::async_trait;

/// An outbound call that must pass the admission gate before it runs.
///
/// Implementors are typically thin wrappers around a client for the
/// downstream service. The gate treats the call as opaque: it only
/// sequences admission before `invoke` and release after it.
#[async_trait]
pub trait Action: Send + Sync {
    /// Value produced by a successful call.
    type Output: Send;
    /// Error produced by a failed call. Passed through the gate unchanged.
    type Error: Send;

    /// Perform the call.
    async fn invoke(&self) -> Result<Self::Output, Self::Error>;
}
