//! Opaque reference generation.
//!
//! Every externally visible identifier the gateway mints is a fixed prefix
//! followed by an alphanumeric payload drawn from the thread-local CSPRNG.
//! The standard payload is 21 characters (~125 bits over a 62-symbol
//! alphabet); API secrets use 32 (~190 bits). Collisions are left to the
//! unique index on the owning table.

use rand::Rng;
use rand::distr::Alphanumeric;

use crate::types::Environment;

/// Payload length for ordinary references.
pub const REFERENCE_LEN: usize = 21;
/// Payload length for API secret keys.
pub const SECRET_LEN: usize = 32;

/// The kinds of references the gateway mints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Payment,
    Transaction,
    Payout,
    Invoice,
    PublishableKey(Environment),
    SecretKey(Environment),
}

impl RefKind {
    fn prefix(&self) -> String {
        match self {
            RefKind::Payment => "pay_".to_string(),
            RefKind::Transaction => "txn_".to_string(),
            RefKind::Payout => "po_".to_string(),
            RefKind::Invoice => "inv_".to_string(),
            RefKind::PublishableKey(env) => format!("pk_{env}_"),
            RefKind::SecretKey(env) => format!("sk_{env}_"),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            RefKind::SecretKey(_) => SECRET_LEN,
            _ => REFERENCE_LEN,
        }
    }
}

/// Mint a fresh reference of the given kind.
pub fn generate(kind: RefKind) -> String {
    let payload: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(kind.payload_len())
        .map(char::from)
        .collect();
    format!("{}{}", kind.prefix(), payload)
}

pub fn payment_reference() -> String {
    generate(RefKind::Payment)
}

pub fn transaction_reference() -> String {
    generate(RefKind::Transaction)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_alphanumeric(s: &str) -> bool {
        s.chars().all(|c| c.is_ascii_alphanumeric())
    }

    #[test]
    fn payment_references_match_the_public_shape() {
        let r = payment_reference();
        assert!(r.starts_with("pay_"));
        let payload = &r["pay_".len()..];
        assert_eq!(payload.len(), 21);
        assert!(is_alphanumeric(payload));
    }

    #[test]
    fn each_kind_carries_its_prefix() {
        assert!(generate(RefKind::Transaction).starts_with("txn_"));
        assert!(generate(RefKind::Payout).starts_with("po_"));
        assert!(generate(RefKind::Invoice).starts_with("inv_"));
        assert!(generate(RefKind::PublishableKey(Environment::Test)).starts_with("pk_test_"));
        assert!(generate(RefKind::SecretKey(Environment::Live)).starts_with("sk_live_"));
    }

    #[test]
    fn secret_keys_use_the_longer_payload() {
        let key = generate(RefKind::SecretKey(Environment::Test));
        assert_eq!(key.len(), "sk_test_".len() + 32);
    }

    #[test]
    fn references_do_not_repeat() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(payment_reference()));
        }
    }
}
