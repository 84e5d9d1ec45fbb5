use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::UserId;

/// The kinds of per-user resources that are computed by the backend and cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// AI insights over the user's recent activity.
    Insights,
    /// Predictions derived from the user's history.
    Predictions,
    /// Recommendations, which change far less often than the other kinds.
    Recommendations,
}

impl ResourceKind {
    /// All resource kinds.
    pub const ALL: [ResourceKind; 3] = [Self::Insights, Self::Predictions, Self::Recommendations];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insights => "insights",
            Self::Predictions => "predictions",
            Self::Recommendations => "recommendations",
        }
    }

    /// The TTL tier that values of this kind are cached for.
    pub fn ttl_tier(&self) -> TtlTier {
        match self {
            Self::Insights | Self::Predictions => TtlTier::Medium,
            Self::Recommendations => TtlTier::Long,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown [`ResourceKind`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown resource kind `{0}`, expected one of insights, predictions, recommendations")]
pub struct UnknownResourceKind(String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownResourceKind(s.to_owned()))
    }
}

/// A named TTL, resolved through [`TtlTiers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtlTier {
    Medium,
    Long,
}

/// The durations behind each [`TtlTier`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TtlTiers {
    /// Defaults to `15m`.
    #[serde(with = "humantime_serde")]
    pub medium: Duration,
    /// Defaults to `1h`.
    #[serde(with = "humantime_serde")]
    pub long: Duration,
}

impl TtlTiers {
    pub fn ttl(&self, tier: TtlTier) -> Duration {
        match tier {
            TtlTier::Medium => self.medium,
            TtlTier::Long => self.long,
        }
    }
}

impl Default for TtlTiers {
    fn default() -> Self {
        Self {
            medium: Duration::from_secs(15 * 60),
            long: Duration::from_secs(60 * 60),
        }
    }
}

/// The key of a cached resource, in the form `<kind>:<user>`.
///
/// Cloning is cheap, the key is shared.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(kind: ResourceKind, user: &UserId) -> Self {
        Self(format!("{kind}:{user}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
