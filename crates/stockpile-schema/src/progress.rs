use serde::{Deserialize, Serialize};

/// A single progress measurement.
///
/// `Definite` carries a known upper bound; `Indefinite` only counts.
/// Both carry a rate estimate in units per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressValue {
    Indefinite {
        current: u64,
        per_second: u64,
    },
    Definite {
        current: u64,
        per_second: u64,
        maximum: u64,
    },
}

impl ProgressValue {
    pub fn indefinite(current: u64, per_second: u64) -> Self {
        Self::Indefinite {
            current,
            per_second,
        }
    }

    pub fn definite(current: u64, per_second: u64, maximum: u64) -> Self {
        Self::Definite {
            current,
            per_second,
            maximum,
        }
    }

    pub fn current(&self) -> u64 {
        match *self {
            Self::Indefinite { current, .. } | Self::Definite { current, .. } => current,
        }
    }

    pub fn per_second(&self) -> u64 {
        match *self {
            Self::Indefinite { per_second, .. } | Self::Definite { per_second, .. } => per_second,
        }
    }

    pub fn maximum(&self) -> Option<u64> {
        match *self {
            Self::Indefinite { .. } => None,
            Self::Definite { maximum, .. } => Some(maximum),
        }
    }

    /// Completion percentage for definite values. The maximum is clamped
    /// to at least 1 so an empty file reports a finite number.
    pub fn percent(&self) -> Option<f64> {
        match *self {
            Self::Indefinite { .. } => None,
            Self::Definite {
                current, maximum, ..
            } => Some(current as f64 / maximum.max(1) as f64 * 100.0),
        }
    }
}

/// Progress of a running operation.
///
/// `major` tracks the outer operation (step N of M), `minor` the current
/// sub-operation (bytes of this file). Both may change in one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<ProgressValue>,
    pub minor: ProgressValue,
    pub status: String,
}

impl Progress {
    pub fn new(
        major: Option<ProgressValue>,
        minor: ProgressValue,
        status: impl Into<String>,
    ) -> Self {
        Self {
            major,
            minor,
            status: status.into(),
        }
    }

    /// Progress with only a status line and no measurable work yet.
    pub fn status(status: impl Into<String>) -> Self {
        Self::new(None, ProgressValue::indefinite(0, 0), status)
    }
}
