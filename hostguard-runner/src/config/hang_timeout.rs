// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::HangTimeoutParseError;
use serde::Deserialize;
use std::{fmt, str::FromStr, time::Duration};

/// Type for the hang timeout, written as `<float>[h|m|s]`.
///
/// A number without a unit is interpreted as seconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HangTimeout(Duration);

impl HangTimeout {
    /// Creates a new hang timeout.
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    /// Returns the timeout as a duration.
    pub fn duration(self) -> Duration {
        self.0
    }
}

impl FromStr for HangTimeout {
    type Err = HangTimeoutParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let (number, multiplier) = match input.char_indices().last() {
            Some((idx, 'h' | 'H')) => (&input[..idx], 3600.0),
            Some((idx, 'm' | 'M')) => (&input[..idx], 60.0),
            Some((idx, 's' | 'S')) => (&input[..idx], 1.0),
            Some(_) => (input, 1.0),
            None => return Err(HangTimeoutParseError::new(s, "timeout is empty")),
        };

        let value: f64 = number.trim().parse().map_err(|_| {
            HangTimeoutParseError::new(s, "expected a number optionally followed by h, m or s")
        })?;
        if !value.is_finite() || value <= 0.0 {
            return Err(HangTimeoutParseError::new(s, "timeout must be positive"));
        }

        let duration = Duration::try_from_secs_f64(value * multiplier)
            .map_err(|_| HangTimeoutParseError::new(s, "timeout is too large"))?;
        Ok(Self(duration))
    }
}

impl fmt::Display for HangTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl<'de> Deserialize<'de> for HangTimeout {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
