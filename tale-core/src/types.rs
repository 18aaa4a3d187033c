//! Core type definitions shared across the tale world model.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

/// Unique identifier for a narrative session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Certainty
// ---------------------------------------------------------------------------

/// Confidence attached to a fact, always within `[0, 1]`.
///
/// Wraps an [`OrderedFloat`] so facts can derive `Eq` and `Hash` and be
/// compared structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Certainty(OrderedFloat<f32>);

impl Certainty {
    /// Full confidence.
    pub const CERTAIN: Self = Self(OrderedFloat(1.0));

    /// Create a certainty, rejecting NaN and values outside `[0, 1]`.
    #[must_use]
    pub fn new(value: f32) -> Option<Self> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            None
        } else {
            Some(Self(OrderedFloat(value)))
        }
    }

    /// Get the raw value.
    #[must_use]
    pub fn value(self) -> f32 {
        self.0.into_inner()
    }
}

impl TryFrom<f32> for Certainty {
    type Error = String;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("certainty {value} outside [0, 1]"))
    }
}

impl From<Certainty> for f32 {
    fn from(c: Certainty) -> Self {
        c.value()
    }
}

impl fmt::Display for Certainty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.value())
    }
}
