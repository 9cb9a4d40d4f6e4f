// =============================================================================
// Broker Adapter — thin typed contract over the brokerage REST API
// =============================================================================
//
// Everything above this module branches on `BrokerErrorKind`, never on
// message text. The client retries idempotent reads only; writes surface
// their first failure to the caller.
// =============================================================================

pub mod client;
pub mod error;
pub mod rate_limit;

pub use client::{
    AccountSnapshot, BrokerClient, BrokerOrder, BrokerPosition, Clock, LatestQuote, LatestTrade,
    OrderRequest,
};
pub use error::{BrokerError, BrokerErrorKind};
