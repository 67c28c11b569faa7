//! Typed header values.
//!
//! Each type models one header's semantic content, already parsed by the
//! transport layer. The engine reads and writes these fields; it never sees
//! header text.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::method::Method;
use crate::uri::Uri;

/// A `name-addr` value: optional display name plus URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display_name: None,
            uri,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "\"{name}\" <{}>", self.uri),
            None => write!(f, "<{}>", self.uri),
        }
    }
}

impl From<Uri> for NameAddr {
    fn from(uri: Uri) -> Self {
        NameAddr::new(uri)
    }
}

/// A From or To header: address plus the dialog tag parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub addr: NameAddr,
    pub tag: Option<String>,
}

impl Party {
    pub fn new(addr: impl Into<NameAddr>) -> Self {
        Party {
            addr: addr.into(),
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn uri(&self) -> &Uri {
        &self.addr.uri
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={tag}")?;
        }
        Ok(())
    }
}

/// CSeq header: sequence number plus method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        CSeq { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// Magic cookie every RFC 3261 branch parameter starts with.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Via header entry: the sender's address and the transaction branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    /// `host:port` the message was sent from.
    pub sent_by: String,
    /// Branch parameter, `z9hG4bK`-prefixed for compliant senders.
    pub branch: String,
}

impl Via {
    pub fn new(sent_by: impl Into<String>, branch: impl Into<String>) -> Self {
        Via {
            sent_by: sent_by.into(),
            branch: branch.into(),
        }
    }

    /// True when the branch carries the RFC 3261 magic cookie.
    pub fn is_rfc3261(&self) -> bool {
        self.branch.starts_with(BRANCH_MAGIC_COOKIE)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/UDP {};branch={}", self.sent_by, self.branch)
    }
}

/// Replaces header content: the dialog an INVITE asks to take over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replaces {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

impl Replaces {
    pub fn new(
        call_id: impl Into<String>,
        to_tag: impl Into<String>,
        from_tag: impl Into<String>,
    ) -> Self {
        Replaces {
            call_id: call_id.into(),
            to_tag: to_tag.into(),
            from_tag: from_tag.into(),
        }
    }
}

impl fmt::Display for Replaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};to-tag={};from-tag={}",
            self.call_id, self.to_tag, self.from_tag
        )
    }
}

/// Refer-To header: transfer target, optionally nominating a dialog to
/// replace (attended transfer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferTo {
    pub target: NameAddr,
    pub replaces: Option<Replaces>,
}

impl ReferTo {
    pub fn new(target: NameAddr) -> Self {
        ReferTo {
            target,
            replaces: None,
        }
    }

    pub fn with_replaces(mut self, replaces: Replaces) -> Self {
        self.replaces = Some(replaces);
        self
    }
}

impl fmt::Display for ReferTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.replaces {
            Some(replaces) => {
                write!(f, "<{}?Replaces={}>", self.target.uri, replaces)
            }
            None => write!(f, "{}", self.target),
        }
    }
}

/// Event package named by an Event header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// The `refer` package carrying transfer progress.
    Refer,
    /// Any other package, kept for diagnostics.
    Other(String),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Refer => f.write_str("refer"),
            EventKind::Other(name) => f.write_str(name),
        }
    }
}

/// Subscription-State header values the transfer flow uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    Active,
    Terminated,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionState::Active => f.write_str("active"),
            SubscriptionState::Terminated => f.write_str("terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_display_carries_tag() {
        let party = Party::new(NameAddr::new(Uri::sip("example.com").with_user("alice")))
            .with_tag("ab12cd34");
        assert_eq!(party.to_string(), "<sip:alice@example.com>;tag=ab12cd34");
    }

    #[test]
    fn via_magic_cookie() {
        let via = Via::new("10.0.0.1:5060", format!("{BRANCH_MAGIC_COOKIE}-77f1"));
        assert!(via.is_rfc3261());
        let legacy = Via::new("10.0.0.1:5060", "1234abcd");
        assert!(!legacy.is_rfc3261());
    }

    #[test]
    fn refer_to_embeds_replaces() {
        let refer_to = ReferTo::new(NameAddr::new(Uri::sip("example.com").with_user("carol")))
            .with_replaces(Replaces::new("call-7", "tag-a", "tag-b"));
        assert_eq!(
            refer_to.to_string(),
            "<sip:carol@example.com?Replaces=call-7;to-tag=tag-a;from-tag=tag-b>"
        );
    }
}
