//! Parameter validation shared by the limiter configs.

use std::time::Duration;

use crate::error::{LimiterError, Result};

/// A drain or refill rate must be a finite, strictly positive number.
pub(crate) fn check_rate(rate: f64) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(LimiterError::Config(format!(
            "rate must be a positive finite number, got {}",
            rate
        )));
    }
    Ok(())
}

pub(crate) fn check_positive(what: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(LimiterError::Config(format!("{} must be positive", what)));
    }
    Ok(())
}

pub(crate) fn check_window(window: Duration) -> Result<()> {
    crate::clock::window_delta(window).map(|_| ())
}
