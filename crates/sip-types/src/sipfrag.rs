//! `message/sipfrag` fragments.
//!
//! A transfer NOTIFY carries the referred call's progress as a one-line SIP
//! fragment: just a status line. RFC 3515 allows full fragments; the engine
//! only ever produces and consumes the status line.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::status::StatusCode;

/// A sipfrag status line, e.g. `SIP/2.0 180 Ringing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipFrag {
    pub status: StatusCode,
    pub reason: String,
}

impl SipFrag {
    /// Fragment for a status code, using its default reason phrase.
    pub fn from_status(status: StatusCode) -> Self {
        SipFrag {
            reason: status.reason_phrase().to_string(),
            status,
        }
    }

    /// Fragment with an explicit reason phrase.
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        SipFrag {
            status,
            reason: reason.into(),
        }
    }

    /// True when the fragment reports ringing-class progress.
    pub fn is_ringing(&self) -> bool {
        matches!(self.status.as_u16(), 180 | 183)
    }
}

impl fmt::Display for SipFrag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}", self.status.as_u16(), self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_status_line() {
        assert_eq!(
            SipFrag::from_status(StatusCode::Ok).to_string(),
            "SIP/2.0 200 OK"
        );
        assert_eq!(
            SipFrag::new(StatusCode::ServiceUnavailable, "Try Later").to_string(),
            "SIP/2.0 503 Try Later"
        );
    }

    #[test]
    fn ringing_classification() {
        assert!(SipFrag::from_status(StatusCode::Ringing).is_ringing());
        assert!(SipFrag::from_status(StatusCode::SessionProgress).is_ringing());
        assert!(!SipFrag::from_status(StatusCode::Ok).is_ringing());
    }
}
