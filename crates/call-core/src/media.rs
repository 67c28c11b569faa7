//! Media collaborator interface.
//!
//! The engine never touches RTP itself. It asks this trait for a media
//! connection, reads back the local capability set to build offers, hands
//! over the negotiated destination, and starts/stops the flows. The codec
//! best-match policy lives here too, with a default any backend can
//! override.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ferrovox_sip_types::{Codec, SessionDescription, SrtpParams};

/// Handle for one media connection owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaConnectionId(u64);

impl MediaConnectionId {
    pub fn from_raw(raw: u64) -> Self {
        MediaConnectionId(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MediaConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "media-{}", self.0)
    }
}

/// Options for creating a media connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaTransportOptions {
    pub enable_video: bool,
    pub srtp_required: bool,
}

/// The local capability set: what we can offer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaCapabilities {
    pub addresses: Vec<String>,
    pub rtp_ports: Vec<u16>,
    pub rtcp_ports: Vec<u16>,
    pub video_ports: Vec<u16>,
    pub codecs: Vec<Codec>,
    pub srtp: Option<SrtpParams>,
    pub bandwidth_kbps: u32,
    pub framerate: u32,
}

impl MediaCapabilities {
    /// Build an offer from these capabilities, capping the candidate list.
    pub fn to_offer(&self, max_candidates: usize) -> SessionDescription {
        let mut offer = SessionDescription {
            addresses: self.addresses.clone(),
            rtp_ports: self.rtp_ports.clone(),
            rtcp_ports: self.rtcp_ports.clone(),
            video_ports: self.video_ports.clone(),
            codecs: self.codecs.clone(),
            srtp: self.srtp.clone(),
            bandwidth_kbps: self.bandwidth_kbps,
            framerate: self.framerate,
        };
        offer.cap_candidates(max_candidates);
        offer
    }
}

/// Outcome of the codec best-match computation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodecSelection {
    /// Common codecs in local preference order; empty means no match.
    pub codecs: Vec<Codec>,
    pub bandwidth_kbps: u32,
    pub framerate: u32,
}

impl CodecSelection {
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

/// Where the negotiated media goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDestination {
    pub address: String,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub video_ports: Vec<u16>,
}

impl MediaDestination {
    /// Destination from the primary candidate of an answer, if it names
    /// a usable address.
    pub fn from_answer(answer: &SessionDescription) -> Option<Self> {
        if answer.is_hold() {
            return None;
        }
        let address = answer.primary_address()?.to_string();
        let rtp_port = answer.primary_rtp_port()?;
        let rtcp_port = answer
            .primary_rtcp_port()
            .unwrap_or(rtp_port.saturating_add(1));
        Some(MediaDestination {
            address,
            rtp_port,
            rtcp_port,
            video_ports: answer.video_ports.clone(),
        })
    }
}

/// Errors from the media backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("could not create media connection: {reason}")]
    ConnectionFailed { reason: String },

    #[error("no such media connection: {id}")]
    NoSuchConnection { id: MediaConnectionId },

    #[error("media operation failed: {reason}")]
    OperationFailed { reason: String },
}

/// The media backend the engine drives.
#[async_trait]
pub trait MediaSession: Send + Sync + fmt::Debug {
    /// Allocate a media connection bound near `local_address`.
    async fn create_connection(
        &self,
        local_address: &str,
        options: MediaTransportOptions,
    ) -> Result<MediaConnectionId, MediaError>;

    /// Local capability set for the connection, at most `max_candidates`
    /// address candidates.
    async fn capabilities(
        &self,
        id: MediaConnectionId,
        max_candidates: usize,
    ) -> Result<MediaCapabilities, MediaError>;

    /// Best-match comparison between the local capability set and a remote
    /// offer: intersect codecs keeping local preference order, take the
    /// lower of the two bandwidth/framerate figures (zero meaning
    /// unconstrained).
    fn negotiate(&self, local: &MediaCapabilities, offered: &SessionDescription) -> CodecSelection {
        let codecs: Vec<Codec> = local
            .codecs
            .iter()
            .filter(|ours| offered.codecs.iter().any(|theirs| ours.matches(theirs)))
            .cloned()
            .collect();

        let bandwidth_kbps = match (local.bandwidth_kbps, offered.bandwidth_kbps) {
            (0, theirs) => theirs,
            (ours, 0) => ours,
            (ours, theirs) => ours.min(theirs),
        };
        let framerate = match (local.framerate, offered.framerate) {
            (0, theirs) => theirs,
            (ours, 0) => ours,
            (ours, theirs) => ours.min(theirs),
        };

        CodecSelection {
            codecs,
            bandwidth_kbps,
            framerate,
        }
    }

    async fn start_rtp_send(
        &self,
        id: MediaConnectionId,
        codecs: &[Codec],
    ) -> Result<(), MediaError>;

    async fn start_rtp_receive(
        &self,
        id: MediaConnectionId,
        codecs: &[Codec],
    ) -> Result<(), MediaError>;

    async fn stop_rtp_send(&self, id: MediaConnectionId) -> Result<(), MediaError>;

    async fn stop_rtp_receive(&self, id: MediaConnectionId) -> Result<(), MediaError>;

    /// Point the connection at the negotiated remote endpoint.
    async fn set_destination(
        &self,
        id: MediaConnectionId,
        destination: MediaDestination,
    ) -> Result<(), MediaError>;

    /// Release the connection and its sockets.
    async fn delete_connection(&self, id: MediaConnectionId) -> Result<(), MediaError>;
}
