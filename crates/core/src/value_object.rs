//! Value objects: equality by value, not identity.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. To
/// "modify" one, build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// ISO-4217-style currency code, normalized to upper case (`VND`, `USD`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn parse(code: impl AsRef<str>) -> Result<Self, DomainError> {
        let code = code.as_ref().trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(format!(
                "currency code must be three letters, got '{code}'"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl ValueObject for Currency {}

/// Amount in the currency's smallest unit (e.g. cents, or whole đồng for VND).
///
/// No arithmetic or conversion lives here: the engine records amounts, it never
/// prices or converts them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount: u64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: u64, currency: Currency) -> Result<Self, DomainError> {
        if amount == 0 {
            return Err(DomainError::validation("amount must be positive"));
        }
        Ok(Self { amount, currency })
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

impl ValueObject for Money {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_is_normalized() {
        assert_eq!(Currency::parse("vnd").unwrap().code(), "VND");
        assert!(Currency::parse("dong").is_err());
        assert!(Currency::parse("u$d").is_err());
    }

    #[test]
    fn zero_amount_is_rejected() {
        let vnd = Currency::parse("VND").unwrap();
        assert!(matches!(
            Money::new(0, vnd.clone()),
            Err(DomainError::Validation(_))
        ));
        assert_eq!(Money::new(100_000, vnd).unwrap().to_string(), "100000 VND");
    }
}
