//! Issuance validity policy.

use crate::{Error, Result};
use std::time::Duration;
use time::OffsetDateTime;

/// Default lifetime of issued identity certificates.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Clock-skew allowance and lifetime applied to every issued certificate.
///
/// `NotBefore = now - clock_skew_allowance` and `NotAfter = now + lifetime`,
/// both truncated to whole seconds since X.509 times carry no fractions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    clock_skew_allowance: Duration,
    lifetime: Duration,
}

/// The concrete validity window of one certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl Validity {
    /// Creates a policy. The lifetime must be at least one second.
    pub fn new(clock_skew_allowance: Duration, lifetime: Duration) -> Result<Self> {
        if lifetime.as_secs() == 0 {
            return Err(Error::InvalidValidity(format!(
                "lifetime must be at least 1s, got {lifetime:?}"
            )));
        }
        Ok(Self {
            clock_skew_allowance,
            lifetime,
        })
    }

    pub fn clock_skew_allowance(&self) -> Duration {
        self.clock_skew_allowance
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Computes the window for a certificate issued at `now`.
    pub fn window(&self, now: OffsetDateTime) -> Result<Window> {
        let now = now
            .replace_nanosecond(0)
            .map_err(|e| Error::InvalidValidity(format!("invalid issuance time: {e}")))?;
        let skew = whole_seconds(self.clock_skew_allowance)?;
        let lifetime = whole_seconds(self.lifetime)?;

        let not_before = now.checked_sub(skew).ok_or_else(|| {
            Error::InvalidValidity("clock skew allowance underflows NotBefore".to_string())
        })?;
        let not_after = now
            .checked_add(lifetime)
            .ok_or_else(|| Error::InvalidValidity("lifetime overflows NotAfter".to_string()))?;

        Ok(Window {
            not_before,
            not_after,
        })
    }
}

impl Default for Validity {
    fn default() -> Self {
        Self {
            clock_skew_allowance: Duration::ZERO,
            lifetime: DEFAULT_LIFETIME,
        }
    }
}

fn whole_seconds(d: Duration) -> Result<time::Duration> {
    i64::try_from(d.as_secs())
        .map(time::Duration::seconds)
        .map_err(|_| Error::InvalidValidity(format!("duration out of range: {d:?}")))
}
