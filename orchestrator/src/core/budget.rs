//! Time budget helpers for stage and dispatch deadlines.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("stage timed out"));
    }
    Ok(remaining)
}

/// Provider wait for one dispatch: the query timeout, cut short by the stage deadline.
pub fn dispatch_timeout(query_timeout: Duration, stage_deadline: Instant) -> Result<Duration> {
    Ok(query_timeout.min(remaining_budget(stage_deadline)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline_is_an_error() {
        let past = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        assert!(remaining_budget(past).is_err());
    }

    #[test]
    fn dispatch_timeout_never_exceeds_stage_budget() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let timeout = dispatch_timeout(Duration::from_secs(120), deadline).expect("budget");
        assert!(timeout <= Duration::from_secs(5));
        let short = dispatch_timeout(Duration::from_secs(1), deadline).expect("budget");
        assert_eq!(short, Duration::from_secs(1));
    }
}
