//! MergeChat license verification.
//!
//! The probe is fatal at startup. At runtime a failure opens a 72-hour
//! grace period with re-checks every 12 hours; the bridge shuts down only
//! if the license is still invalid when the grace period ends.

use std::time::Duration;

use serde_json::{Value, json};

use maxbridge_core::config::MergechatConfig;

use crate::BridgeError;

/// Interval between routine license checks.
const CHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);
/// Re-check interval while in grace.
const GRACE_RECHECK: Duration = Duration::from_secs(12 * 3600);
/// Length of the grace period.
const GRACE_PERIOD_SECS: u64 = 72 * 3600;

/// Outcome of one license check fed through the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseDecision {
    /// License valid; normal cadence.
    Valid,
    /// First failure; the grace period starts now.
    EnterGrace,
    /// Still failing inside the grace period.
    InGrace,
    /// Grace expired with the license still invalid.
    Shutdown,
}

/// Pure grace-period state machine, driven by check results and timestamps
/// so tests need no wall clock.
#[derive(Debug, Default)]
pub struct LicenseTracker {
    grace_deadline: Option<u64>,
}

impl LicenseTracker {
    /// Create a tracker with no failure recorded.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            grace_deadline: None,
        }
    }

    /// Feed one check result at the given Unix time.
    pub fn on_check(&mut self, valid: bool, now: u64) -> LicenseDecision {
        if valid {
            self.grace_deadline = None;
            return LicenseDecision::Valid;
        }
        match self.grace_deadline {
            None => {
                self.grace_deadline = Some(now + GRACE_PERIOD_SECS);
                LicenseDecision::EnterGrace
            }
            Some(deadline) if now < deadline => LicenseDecision::InGrace,
            Some(_) => LicenseDecision::Shutdown,
        }
    }

    /// How long to sleep before the next check.
    #[must_use]
    pub const fn next_delay(&self) -> Duration {
        if self.grace_deadline.is_some() {
            GRACE_RECHECK
        } else {
            CHECK_INTERVAL
        }
    }
}

/// Client for the license verification endpoint.
pub struct LicenseClient {
    http: reqwest::Client,
    config: MergechatConfig,
}

impl LicenseClient {
    /// Create a license client.
    ///
    /// # Panics
    ///
    /// Panics if the TLS backend cannot be initialized.
    #[must_use]
    pub fn new(config: MergechatConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        Self { http, config }
    }

    /// Run one verification probe.
    ///
    /// # Errors
    ///
    /// Returns the failure reason when the license is not valid.
    pub async fn check(&self) -> Result<(), String> {
        if self.config.license_key.is_empty() || self.config.server_id.is_empty() {
            return Err("license_key and server_id are required".to_string());
        }
        let url = format!("{}/license/verify", self.config.api_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "license_key": self.config.license_key,
                "server_id": self.config.server_id,
                "module": "max",
            }))
            .send()
            .await
            .map_err(|e| format!("connection error: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {status}: {body}"));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("invalid response: {e}"))?;
        if !body.get("valid").and_then(Value::as_bool).unwrap_or(false) {
            return Err(body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string());
        }
        // An empty allowed list means every bridge module is allowed.
        if let Some(allowed) = body.get("allowed_bridges").and_then(Value::as_array) {
            if !allowed.is_empty() && !allowed.iter().any(|module| module == "max") {
                return Err("module 'max' not in allowed bridges".to_string());
            }
        }
        Ok(())
    }

    /// Verify at startup; a failure here is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::License`] with the failure reason.
    pub async fn verify_startup(&self) -> Result<(), BridgeError> {
        match self.check().await {
            Ok(()) => {
                tracing::info!("license verified");
                Ok(())
            }
            Err(reason) => Err(BridgeError::License(reason)),
        }
    }
}

/// The periodic license check loop.
pub struct LicenseSchedule {
    client: LicenseClient,
    tracker: LicenseTracker,
}

impl LicenseSchedule {
    /// Create the schedule around a client.
    #[must_use]
    pub const fn new(client: LicenseClient) -> Self {
        Self {
            client,
            tracker: LicenseTracker::new(),
        }
    }

    /// Run until the grace period expires with the license still invalid.
    ///
    /// Returns only when the bridge must shut down; the caller exits with
    /// a non-zero code.
    pub async fn run(mut self) {
        loop {
            tokio::time::sleep(self.tracker.next_delay()).await;
            let result = self.client.check().await;
            let valid = result.is_ok();
            match self.tracker.on_check(valid, unix_now()) {
                LicenseDecision::Valid => tracing::debug!("periodic license check passed"),
                LicenseDecision::EnterGrace => tracing::error!(
                    reason = %result.err().unwrap_or_default(),
                    "license verification failed; shutting down in 72 hours unless resolved"
                ),
                LicenseDecision::InGrace => {
                    tracing::warn!("license still invalid, re-checking in 12 hours");
                }
                LicenseDecision::Shutdown => {
                    tracing::error!("license still invalid after 72-hour grace period");
                    return;
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3600;

    #[test]
    fn grace_runs_for_72_hours() {
        let mut tracker = LicenseTracker::new();
        let t0 = 1_000_000;

        assert_eq!(tracker.on_check(false, t0), LicenseDecision::EnterGrace);
        assert_eq!(tracker.next_delay(), GRACE_RECHECK);
        for step in 1..6 {
            assert_eq!(
                tracker.on_check(false, t0 + step * 12 * HOUR),
                LicenseDecision::InGrace,
                "step {step}"
            );
        }
        assert_eq!(
            tracker.on_check(false, t0 + 72 * HOUR),
            LicenseDecision::Shutdown
        );
    }

    #[test]
    fn recovery_during_grace_resets() {
        let mut tracker = LicenseTracker::new();
        let t0 = 1_000_000;
        tracker.on_check(false, t0);
        assert_eq!(
            tracker.on_check(true, t0 + 12 * HOUR),
            LicenseDecision::Valid
        );
        assert_eq!(tracker.next_delay(), CHECK_INTERVAL);
        // A later failure opens a fresh grace period.
        assert_eq!(
            tracker.on_check(false, t0 + 100 * HOUR),
            LicenseDecision::EnterGrace
        );
        assert_eq!(
            tracker.on_check(false, t0 + 171 * HOUR),
            LicenseDecision::InGrace
        );
    }

    #[test]
    fn valid_checks_stay_on_daily_cadence() {
        let mut tracker = LicenseTracker::new();
        assert_eq!(tracker.on_check(true, 0), LicenseDecision::Valid);
        assert_eq!(tracker.next_delay(), CHECK_INTERVAL);
    }

    #[tokio::test]
    async fn missing_credentials_fail_closed() {
        let client = LicenseClient::new(MergechatConfig::default());
        assert!(client.check().await.is_err());
        assert!(client.verify_startup().await.is_err());
    }
}
