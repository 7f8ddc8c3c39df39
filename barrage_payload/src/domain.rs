//! Values drawn from the banking domain the target serves.
//!
//! Every function here is total over its declared domain. Randomness is
//! always supplied by the caller, time is passed in as `now` so that results
//! are reproducible under a seeded generator.

use std::{fmt, time::Duration};

use rand::{Rng, distr::StandardUniform, prelude::Distribution};
use serde::{Serialize, Serializer};
use time::{OffsetDateTime, macros::format_description};

use crate::weighted::Weighted;

/// Smallest eight digit account number.
pub const ACCOUNT_MIN: u32 = 10_000_000;
/// Exclusive upper bound on account numbers.
pub const ACCOUNT_MAX: u32 = 99_999_999;
/// Default upper bound on generated amounts, in whole currency units.
pub const DEFAULT_AMOUNT_CEILING: f64 = 5_000_000.0;
/// Default window into the past that timestamps are drawn from.
pub const DEFAULT_TIMESTAMP_WINDOW: Duration = Duration::from_secs(10_000_000);
/// Tenants served by the target's routing layer.
pub const DEFAULT_TENANTS: [&str; 3] = ["alpha", "beta", "gamma"];

/// Uniform integer in `[min, max)`. An empty range yields `min`.
pub fn int_in_range<R>(rng: &mut R, min: u64, max: u64) -> u64
where
    R: Rng + ?Sized,
{
    if min >= max {
        return min;
    }
    rng.random_range(min..max)
}

/// An eight digit account number.
#[allow(clippy::cast_possible_truncation)]
pub fn account<R>(rng: &mut R) -> u32
where
    R: Rng + ?Sized,
{
    // bounded by ACCOUNT_MAX, fits in u32
    int_in_range(rng, u64::from(ACCOUNT_MIN), u64::from(ACCOUNT_MAX)) as u32
}

/// The kinds of Islamic finance transaction the target understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    /// Profit-sharing partnership
    Mudarabah,
    /// Joint venture
    Musharakah,
    /// Cost-plus sale
    Murabaha,
    /// Benevolent loan
    QardHasanah,
    /// Lease
    Ijarah,
    /// Certificate
    Sukuk,
}

impl TransactionType {
    /// Every variant, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Mudarabah,
        Self::Musharakah,
        Self::Murabaha,
        Self::QardHasanah,
        Self::Ijarah,
        Self::Sukuk,
    ];

    /// The label the target expects on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mudarabah => "mudarabah",
            Self::Musharakah => "musharakah",
            Self::Murabaha => "murabaha",
            Self::QardHasanah => "qard hasanah",
            Self::Ijarah => "ijarah",
            Self::Sukuk => "sukuk",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TransactionType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl Distribution<TransactionType> for StandardUniform {
    fn sample<R>(&self, rng: &mut R) -> TransactionType
    where
        R: Rng + ?Sized,
    {
        TransactionType::ALL[rng.random_range(0..TransactionType::ALL.len())]
    }
}

/// A non-negative monetary amount with two decimal places.
///
/// Held in cents so the two-decimal guarantee holds by construction. It is
/// written to JSON as a plain number, `1234.5` for 123450 cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount {
    cents: u64,
}

impl Amount {
    /// Convert a ceiling in whole currency units to the largest whole number
    /// of cents not above it. Negative and non-finite ceilings collapse to
    /// zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn ceiling_cents(ceiling: f64) -> u64 {
        if !(ceiling.is_finite() && ceiling > 0.0) {
            return 0;
        }
        // Rounding absorbs float error in `ceiling * 100`, e.g. 0.29 becomes
        // 28.999999999999996. A sub-cent remainder can still round up.
        let cents = (ceiling * 100.0).round() as u64;
        if (Self { cents }).as_f64() > ceiling {
            cents.saturating_sub(1)
        } else {
            cents
        }
    }

    /// Draw an amount uniformly from `[0, ceiling_cents]` cents.
    pub fn sample<R>(rng: &mut R, ceiling_cents: u64) -> Self
    where
        R: Rng + ?Sized,
    {
        Self {
            cents: rng.random_range(0..=ceiling_cents),
        }
    }

    /// The amount in cents.
    #[must_use]
    pub fn cents(self) -> u64 {
        self.cents
    }

    /// The amount in whole currency units.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        self.cents as f64 / 100.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.cents / 100, self.cents % 100)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.as_f64())
    }
}

/// A point in time, serialized as ISO-8601 UTC with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    /// The underlying date-time.
    #[must_use]
    pub fn datetime(self) -> OffsetDateTime {
        self.0
    }

    /// Render as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    ///
    /// # Errors
    ///
    /// Fails only if the year cannot be written with four digits.
    pub fn to_iso8601(self) -> Result<String, time::error::Format> {
        self.0
            .to_offset(time::UtcOffset::UTC)
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
            ))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.to_iso8601().map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let rendered = self.to_iso8601().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&rendered)
    }
}

/// `now` minus a uniform offset in `[0, window)`, at millisecond granularity.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn past_timestamp<R>(rng: &mut R, now: OffsetDateTime, window: Duration) -> Timestamp
where
    R: Rng + ?Sized,
{
    let window_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    let offset = int_in_range(rng, 0, window_millis);
    // i64 milliseconds spans ~292 million years
    let offset = time::Duration::milliseconds(offset.min(i64::MAX as u64) as i64);
    Timestamp(now.saturating_sub(offset))
}

/// Bounds on the values drawn by [`Domain::entities`].
#[derive(Debug, Clone, PartialEq)]
pub struct Domain {
    amount_ceiling_cents: u64,
    timestamp_window: Duration,
    tenants: Weighted<String>,
}

impl Domain {
    /// Create a new [`Domain`].
    #[must_use]
    pub fn new(amount_ceiling: f64, timestamp_window: Duration, tenants: Weighted<String>) -> Self {
        Self {
            amount_ceiling_cents: Amount::ceiling_cents(amount_ceiling),
            timestamp_window,
            tenants,
        }
    }

    /// The largest amount, in cents, this domain will produce.
    #[must_use]
    pub fn amount_ceiling_cents(&self) -> u64 {
        self.amount_ceiling_cents
    }

    /// How far into the past timestamps reach.
    #[must_use]
    pub fn timestamp_window(&self) -> Duration {
        self.timestamp_window
    }

    /// Choose a tenant uniformly.
    pub fn tenant<R>(&self, rng: &mut R) -> &str
    where
        R: Rng + ?Sized,
    {
        self.tenants.choose(rng)
    }

    /// Draw a fresh set of entities for one iteration.
    pub fn entities<R>(&self, rng: &mut R, now: OffsetDateTime) -> Entities
    where
        R: Rng + ?Sized,
    {
        Entities {
            tenant: self.tenant(rng).to_string(),
            transaction_type: rng.random(),
            account: account(rng),
            from_account: account(rng),
            to_account: account(rng),
            amount: Amount::sample(rng, self.amount_ceiling_cents),
            from_amount: Amount::sample(rng, self.amount_ceiling_cents),
            to_amount: Amount::sample(rng, self.amount_ceiling_cents),
            time: past_timestamp(rng, now, self.timestamp_window),
            from_time: past_timestamp(rng, now, self.timestamp_window),
            to_time: past_timestamp(rng, now, self.timestamp_window),
        }
    }
}

/// The values one iteration may place in its request. Drawn fresh every
/// iteration and discarded after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Entities {
    /// Tenant the request is routed to
    pub tenant: String,
    /// Transaction type label
    pub transaction_type: TransactionType,
    /// Account searched for
    pub account: u32,
    /// Transfer source account
    pub from_account: u32,
    /// Transfer destination account
    pub to_account: u32,
    /// Transfer amount
    pub amount: Amount,
    /// Lower bound of a searched amount range
    pub from_amount: Amount,
    /// Upper bound of a searched amount range
    pub to_amount: Amount,
    /// Transfer time
    pub time: Timestamp,
    /// Lower bound of a searched time range
    pub from_time: Timestamp,
    /// Upper bound of a searched time range
    pub to_time: Timestamp,
}
