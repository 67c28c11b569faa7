//! Transport collaborator interface.
//!
//! Outbound messages go through [`SipTransport::send`]. Inbound traffic and
//! delivery reports come back as [`SipEvent`]s on an mpsc channel the engine
//! owns. A report always carries the message it concerns, so late failures
//! (a TCP reset after a re-INVITE went out) can be routed back to the dialog
//! that sent it.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ferrovox_sip_types::Message;

/// Delivery status attached to an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// A message arrived from the wire.
    Normal,
    /// The transport could not deliver the attached outbound message.
    TransportError,
    /// The attached request was answered with an auth challenge and the
    /// transport layer is retrying with credentials. Not a failure.
    AuthenticationRetry,
    /// Session refresh timer fired for the dialog of the attached message.
    SessionReinviteTimer,
}

/// One unit of work from the transport: a message plus how it got here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipEvent {
    pub message: Message,
    pub status: MessageStatus,
}

impl SipEvent {
    /// An inbound message from the network.
    pub fn inbound(message: impl Into<Message>) -> Self {
        SipEvent {
            message: message.into(),
            status: MessageStatus::Normal,
        }
    }

    /// A delivery report for an outbound message.
    pub fn report(message: impl Into<Message>, status: MessageStatus) -> Self {
        SipEvent {
            message: message.into(),
            status,
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.status == MessageStatus::Normal
    }
}

/// Channel pair the engine reads transport events from.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<SipEvent>, mpsc::Receiver<SipEvent>) {
    mpsc::channel(capacity)
}

/// Errors surfaced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    #[error("transport is closed")]
    Closed,
}

/// The wire the engine writes to.
#[async_trait]
pub trait SipTransport: Send + Sync + fmt::Debug {
    async fn send(&self, message: Message) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrovox_sip_types::{Method, Party, Request, Uri};

    fn probe() -> Request {
        Request::new(
            Method::Options,
            Uri::sip("server.test").with_user("bob"),
            "call-1".to_string(),
            Party::new(Uri::sip("client.test").with_user("alice")).with_tag("t1"),
            Party::new(Uri::sip("server.test").with_user("bob")),
            1,
        )
    }

    #[test]
    fn inbound_events_report_normal_status() {
        let event = SipEvent::inbound(probe());
        assert!(event.is_inbound());
        assert_eq!(event.status, MessageStatus::Normal);
    }

    #[test]
    fn reports_keep_their_status() {
        let event = SipEvent::report(probe(), MessageStatus::TransportError);
        assert!(!event.is_inbound());
        assert_eq!(event.status, MessageStatus::TransportError);
    }

    #[tokio::test]
    async fn event_channel_delivers_in_order() {
        let (tx, mut rx) = event_channel(4);
        tx.send(SipEvent::inbound(probe())).await.unwrap();
        tx.send(SipEvent::report(probe(), MessageStatus::SessionReinviteTimer))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_inbound());
        assert_eq!(
            rx.recv().await.unwrap().status,
            MessageStatus::SessionReinviteTimer
        );
    }
}
