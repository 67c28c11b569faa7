//! Engine configuration.
//!
//! One config struct per engine, built with chained `with_*` methods and
//! checked once by `validate` before the engine starts. Timer arithmetic
//! (retransmit ceiling, state timeout) lives here so every component reads
//! the same derived values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use ferrovox_sip_types::Uri;

/// Retransmission and supervision timers.
///
/// T1 is the base retransmit interval. The interval doubles on each resend
/// up to the ceiling T2 = 8×T1; a transaction older than 10×T2 with no
/// conclusion is expired. INVITE transactions get a longer garbage-collect
/// horizon because the human on the far end may ring for minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    /// Base retransmit interval.
    pub t1: Duration,
    /// Minimum lifetime of an INVITE transaction before garbage collection.
    pub invite_timeout: Duration,
    /// Forced teardown when the final response to a CANCEL never arrives.
    pub cancel_safety: Duration,
    /// Auto-reject an inbound leg left unanswered in Offering. Disabled
    /// when `None`.
    pub offering_delay: Option<Duration>,
    /// Cancel an outbound leg left ringing in Alerting. Disabled when
    /// `None`.
    pub ring_no_answer: Option<Duration>,
    /// Period of the engine's garbage-collection tick.
    pub gc_interval: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        TimerSettings {
            t1: Duration::from_millis(500),
            invite_timeout: Duration::from_secs(180),
            cancel_safety: Duration::from_secs(32),
            offering_delay: None,
            ring_no_answer: None,
            gc_interval: Duration::from_secs(10),
        }
    }
}

impl TimerSettings {
    /// Retransmit ceiling: 8×T1.
    pub fn t2(&self) -> Duration {
        self.t1 * 8
    }

    /// Overall transaction state timeout: 10×T2.
    pub fn state_timeout(&self) -> Duration {
        self.t2() * 10
    }
}

/// Everything the engine needs to know about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEngineConfig {
    /// Address of record used in From for locally initiated dialogs.
    pub local_uri: Uri,
    /// Contact advertised in requests and 2xx responses.
    pub local_contact: Uri,
    /// Display name for the local party, when set.
    pub display_name: Option<String>,
    /// Timer settings.
    pub timers: TimerSettings,
    /// How many 3xx redirects to chase on the initial INVITE.
    pub max_redirects: u32,
    /// Cap on ICE-style address candidates placed in an offer.
    pub max_address_candidates: usize,
    /// When set, early-media answers in 18x responses are ignored.
    pub suppress_early_media: bool,
    /// When set, an offer without SRTP parameters is refused.
    pub require_encryption: bool,
    /// Bound of the lifecycle event channel.
    pub event_queue_capacity: usize,
}

impl CallEngineConfig {
    /// Config with defaults for an endpoint reachable at `local_contact`.
    pub fn new(local_uri: Uri, local_contact: Uri) -> Self {
        CallEngineConfig {
            local_uri,
            local_contact,
            display_name: None,
            timers: TimerSettings::default(),
            max_redirects: 1,
            max_address_candidates: 12,
            suppress_early_media: false,
            require_encryption: false,
            event_queue_capacity: 128,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_offering_delay(mut self, delay: Duration) -> Self {
        self.timers.offering_delay = Some(delay);
        self
    }

    pub fn with_ring_no_answer(mut self, timeout: Duration) -> Self {
        self.timers.ring_no_answer = Some(timeout);
        self
    }

    pub fn with_max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn with_max_address_candidates(mut self, max: usize) -> Self {
        self.max_address_candidates = max;
        self
    }

    pub fn with_suppressed_early_media(mut self) -> Self {
        self.suppress_early_media = true;
        self
    }

    pub fn with_required_encryption(mut self) -> Self {
        self.require_encryption = true;
        self
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.timers.t1.is_zero() {
            return Err("t1 must be non-zero".to_string());
        }
        if self.timers.invite_timeout < self.timers.state_timeout() {
            return Err(format!(
                "invite_timeout {:?} is shorter than the state timeout {:?}",
                self.timers.invite_timeout,
                self.timers.state_timeout()
            ));
        }
        if self.max_address_candidates == 0 {
            return Err("max_address_candidates must be at least 1".to_string());
        }
        if self.event_queue_capacity == 0 {
            return Err("event_queue_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}
