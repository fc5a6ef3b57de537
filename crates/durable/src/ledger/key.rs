//! Idempotency keys and money amounts

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error parsing an [`Amount`] or [`IdempotencyKey`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    /// Amount is not a decimal with at most two fractional digits
    #[error("invalid amount: {0:?}")]
    InvalidAmount(String),

    /// Key does not have the `customer:amount:discriminator` shape
    #[error("malformed idempotency key: {0:?}")]
    MalformedKey(String),
}

/// A monetary amount in minor units (cents)
///
/// Amounts render as `"99.99"` and are never stored as floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount {
    cents: i64,
}

impl Amount {
    /// Create an amount from minor units
    pub const fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    /// Amount in minor units
    pub const fn cents(&self) -> i64 {
        self.cents
    }

    /// Whether the amount is strictly greater than zero
    pub const fn is_positive(&self) -> bool {
        self.cents > 0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.cents < 0 { "-" } else { "" };
        let abs = self.cents.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Amount {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KeyParseError::InvalidAmount(s.to_string());
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if frac.len() > 2 || !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let frac: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => frac.parse().map_err(|_| invalid())?,
        };

        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac))
            .ok_or_else(invalid)?;

        Ok(Self::from_cents(if negative { -cents } else { cents }))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(f64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Number(value) if value.is_finite() => {
                Ok(Self::from_cents((value * 100.0).round() as i64))
            }
            Repr::Number(value) => Err(serde::de::Error::custom(format!(
                "invalid amount: {value}"
            ))),
        }
    }
}

/// Key identifying one logical side effect
///
/// Rendered as `customer_id:amount:discriminator`, for example
/// `c1:99.99:0192f0c4-...`. The discriminator is the workflow instance id, so
/// retries and replays of the same instance share one key while two instances
/// charging the same customer the same amount do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    customer_id: String,
    amount: Amount,
    discriminator: String,
}

impl IdempotencyKey {
    /// Build a key from its components
    pub fn new(
        customer_id: impl Into<String>,
        amount: Amount,
        discriminator: impl Into<String>,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            amount,
            discriminator: discriminator.into(),
        }
    }

    /// Customer the effect applies to
    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    /// Amount of the effect
    pub fn amount(&self) -> Amount {
        self.amount
    }

    /// Discriminator (usually the workflow instance id)
    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.customer_id, self.amount, self.discriminator)
    }
}

impl FromStr for IdempotencyKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Customer ids may contain ':', so split from the right.
        let mut parts = s.rsplitn(3, ':');
        let discriminator = parts.next().filter(|p| !p.is_empty());
        let amount = parts.next();
        let customer_id = parts.next().filter(|p| !p.is_empty());

        match (customer_id, amount, discriminator) {
            (Some(customer_id), Some(amount), Some(discriminator)) => Ok(Self {
                customer_id: customer_id.to_string(),
                amount: amount.parse()?,
                discriminator: discriminator.to_string(),
            }),
            _ => Err(KeyParseError::MalformedKey(s.to_string())),
        }
    }
}

impl Serialize for IdempotencyKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IdempotencyKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
