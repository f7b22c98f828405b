use crate::error::RiskError;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct StopState {
    active: AtomicBool,
    reason: Mutex<Option<String>>,
    reset_token: Option<String>,
}

/// Process-wide trading halt. Clones share one flag.
///
/// Once triggered the flag stays set until [`EmergencyStop::reset`] is called
/// with the configured operator token; nothing clears it automatically.
#[derive(Clone)]
pub struct EmergencyStop {
    state: Arc<StopState>,
}

impl EmergencyStop {
    pub fn new(reset_token: Option<String>) -> Self {
        Self {
            state: Arc::new(StopState {
                active: AtomicBool::new(false),
                reason: Mutex::new(None),
                reset_token: reset_token.filter(|t| !t.is_empty()),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Sets the flag. Returns `false` if it was already set, leaving the
    /// original reason in place.
    pub fn trigger(&self, reason: &str) -> bool {
        if self
            .state
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if let Ok(mut slot) = self.state.reason.lock() {
            *slot = Some(reason.to_string());
        }
        warn!("[RISK] Emergency stop engaged: {}", reason);
        true
    }

    pub fn reason(&self) -> Option<String> {
        self.state.reason.lock().ok().and_then(|r| r.clone())
    }

    pub fn reset(&self, token: &str) -> Result<(), RiskError> {
        let expected = self
            .state
            .reset_token
            .as_deref()
            .ok_or(RiskError::ResetUnavailable)?;
        if token != expected {
            warn!("[RISK] Emergency stop reset rejected: bad token");
            return Err(RiskError::InvalidResetToken);
        }
        if self
            .state
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RiskError::NotStopped);
        }
        if let Ok(mut slot) = self.state.reason.lock() {
            *slot = None;
        }
        info!("[RISK] Emergency stop cleared by operator");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_idempotent() {
        let stop = EmergencyStop::new(Some("secret".to_string()));
        assert!(!stop.is_active());
        assert!(stop.trigger("EXTREME_DRAWDOWN"));
        assert!(!stop.trigger("EXTREME_DAILY_LOSS"));
        assert!(stop.is_active());
        assert_eq!(stop.reason().as_deref(), Some("EXTREME_DRAWDOWN"));
    }

    #[test]
    fn test_clones_share_the_flag() {
        let stop = EmergencyStop::new(None);
        let other = stop.clone();
        stop.trigger("test");
        assert!(other.is_active());
    }

    #[test]
    fn test_reset_requires_token() {
        let stop = EmergencyStop::new(Some("secret".to_string()));
        assert_eq!(stop.reset("secret"), Err(RiskError::NotStopped));

        stop.trigger("test");
        assert_eq!(stop.reset("guess"), Err(RiskError::InvalidResetToken));
        assert!(stop.is_active());

        assert_eq!(stop.reset("secret"), Ok(()));
        assert!(!stop.is_active());
        assert!(stop.reason().is_none());
    }

    #[test]
    fn test_reset_unavailable_without_token() {
        let stop = EmergencyStop::new(Some(String::new()));
        stop.trigger("test");
        assert_eq!(stop.reset(""), Err(RiskError::ResetUnavailable));
        assert!(stop.is_active());
    }
}
