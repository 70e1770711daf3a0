//! Core domain types shared across the gateway.
//!
//! These are the enums that travel between the HTTP layer, the relational
//! store, the queue workers, and the provider adapters: payment channels,
//! currencies, lifecycle statuses, ledger entry kinds, and outbound event
//! types. All of them serialize to the lowercase / snake_case wire form the
//! public API exposes, and all of them round-trip through `Display`/`FromStr`
//! for storage as `TEXT` columns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Error returned when a textual enum value read from the wire or the
/// database does not match any known variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A payment processor supported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Moncash,
    Natcash,
    Stripe,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Moncash, Channel::Natcash, Channel::Stripe];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Moncash => "moncash",
            Channel::Natcash => "natcash",
            Channel::Stripe => "stripe",
        }
    }

    /// Name of the dispatch queue owned by this channel.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Channel::Moncash => "payments.moncash",
            Channel::Natcash => "payments.natcash",
            Channel::Stripe => "payments.stripe",
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "moncash" => Ok(Channel::Moncash),
            "natcash" => Ok(Channel::Natcash),
            "stripe" => Ok(Channel::Stripe),
            other => Err(UnknownVariant::new("channel", other)),
        }
    }
}

/// Settlement currency a payment is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "HTG")]
    Htg,
    #[serde(rename = "USD")]
    Usd,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Htg => "HTG",
            Currency::Usd => "USD",
        }
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HTG" => Ok(Currency::Htg),
            "USD" => Ok(Currency::Usd),
            other => Err(UnknownVariant::new("currency", other)),
        }
    }
}

/// Authoritative lifecycle state of a payment.
///
/// The graph is monotonic: `pending → processing → {completed, failed,
/// cancelled}`, `pending → {failed, expired}`, and the refund tail
/// `completed → partially_refunded → refunded`. No reverse edges exist, and
/// a transition whose target equals the current state is a successful no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Expired,
    PartiallyRefunded,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Expired => "expired",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Whether a forward edge `self → target` exists in the lifecycle graph.
    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Completed, PartiallyRefunded)
                | (Completed, Refunded)
                | (PartiallyRefunded, Refunded)
        )
    }

    /// States that admit a refund.
    pub fn is_refundable(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::PartiallyRefunded
        )
    }

    /// States in which the payer's money has been captured.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Failed
                | PaymentStatus::Cancelled
                | PaymentStatus::Expired
                | PaymentStatus::Refunded
        )
    }
}

impl Display for PaymentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "expired" => Ok(PaymentStatus::Expired),
            "partially_refunded" => Ok(PaymentStatus::PartiallyRefunded),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(UnknownVariant::new("payment status", other)),
        }
    }
}

/// Kind of a ledger entry recorded against a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Credit,
    Refund,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Credit => "credit",
            LedgerKind::Refund => "refund",
        }
    }
}

impl Display for LedgerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(LedgerKind::Credit),
            "refund" => Ok(LedgerKind::Refund),
            other => Err(UnknownVariant::new("ledger kind", other)),
        }
    }
}

/// Outbound notification types merchants can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.cancelled")]
    PaymentCancelled,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentSucceeded => "payment.succeeded",
            EventType::PaymentFailed => "payment.failed",
            EventType::PaymentCancelled => "payment.cancelled",
            EventType::PaymentRefunded => "payment.refunded",
        }
    }

    /// Whether a subscription list covers this event. `"*"` subscribes to
    /// everything.
    pub fn matches_subscription(&self, subscribed: &[String]) -> bool {
        subscribed
            .iter()
            .any(|entry| entry == "*" || entry == self.as_str())
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment.succeeded" => Ok(EventType::PaymentSucceeded),
            "payment.failed" => Ok(EventType::PaymentFailed),
            "payment.cancelled" => Ok(EventType::PaymentCancelled),
            "payment.refunded" => Ok(EventType::PaymentRefunded),
            other => Err(UnknownVariant::new("event type", other)),
        }
    }
}

/// Delivery state of one outbound webhook log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(UnknownVariant::new("delivery status", other)),
        }
    }
}

/// Merchant environment a key (and everything created with it) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Test,
    Live,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Live => "live",
        }
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(Environment::Test),
            "live" => Ok(Environment::Live),
            other => Err(UnknownVariant::new("environment", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_graph_has_no_reverse_edges() {
        use PaymentStatus::*;
        let all = [
            Pending,
            Processing,
            Completed,
            Failed,
            Cancelled,
            Expired,
            PartiallyRefunded,
            Refunded,
        ];
        for from in all {
            for to in all {
                if from.can_transition_to(to) {
                    assert!(!to.can_transition_to(from), "reverse edge {from} <-> {to}");
                }
            }
        }
        // Terminal states have no outgoing edges.
        for from in [Failed, Cancelled, Expired, Refunded] {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} should not exist");
            }
        }
    }

    #[test]
    fn refund_tail_transitions() {
        assert!(PaymentStatus::Completed.can_transition_to(PaymentStatus::PartiallyRefunded));
        assert!(PaymentStatus::Completed.can_transition_to(PaymentStatus::Refunded));
        assert!(PaymentStatus::PartiallyRefunded.can_transition_to(PaymentStatus::Refunded));
        assert!(!PaymentStatus::PartiallyRefunded.can_transition_to(PaymentStatus::Completed));
    }

    #[test]
    fn event_subscription_matching() {
        let explicit = vec!["payment.succeeded".to_string()];
        let wildcard = vec!["*".to_string()];
        assert!(EventType::PaymentSucceeded.matches_subscription(&explicit));
        assert!(!EventType::PaymentFailed.matches_subscription(&explicit));
        assert!(EventType::PaymentFailed.matches_subscription(&wildcard));
    }

    #[test]
    fn wire_round_trips() {
        for channel in Channel::ALL {
            assert_eq!(channel, channel.as_str().parse().unwrap());
        }
        assert_eq!(serde_json::to_string(&Currency::Htg).unwrap(), "\"HTG\"");
        assert_eq!(
            serde_json::to_string(&PaymentStatus::PartiallyRefunded).unwrap(),
            "\"partially_refunded\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::PaymentSucceeded).unwrap(),
            "\"payment.succeeded\""
        );
    }
}
