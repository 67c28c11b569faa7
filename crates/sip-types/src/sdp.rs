//! Offer/answer session description.
//!
//! A structured stand-in for an SDP body: parallel candidate arrays (one
//! entry per ICE-style candidate, index 0 primary), the codec list, and the
//! session parameters the engine negotiates over. Wire SDP never appears
//! here; the transport boundary converts in both directions.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Address a hold offer advertises in place of a media destination.
pub const NULL_MEDIA_ADDRESS: &str = "0.0.0.0";

/// One negotiable codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codec {
    /// Encoding name, e.g. `PCMU`, `G729`, `H264`.
    pub name: String,
    /// Clock rate in Hz.
    pub clock_rate: u32,
    /// RTP payload type number.
    pub payload_type: u8,
}

impl Codec {
    pub fn new(name: impl Into<String>, clock_rate: u32, payload_type: u8) -> Self {
        Codec {
            name: name.into(),
            clock_rate,
            payload_type,
        }
    }

    /// Codecs match on name and clock rate; payload type is per-endpoint.
    pub fn matches(&self, other: &Codec) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.clock_rate == other.clock_rate
    }
}

/// SRTP keying material, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrtpParams {
    pub suite: String,
    pub key_material: Bytes,
}

/// The offer/answer payload carried in INVITE bodies and final responses.
///
/// The candidate arrays are parallel: `addresses[i]`, `rtp_ports[i]`,
/// `rtcp_ports[i]` and (when video is offered) `video_ports[i]` describe
/// candidate `i`. Index 0 is the primary candidate used for hold detection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionDescription {
    pub addresses: Vec<String>,
    pub rtp_ports: Vec<u16>,
    pub rtcp_ports: Vec<u16>,
    pub video_ports: Vec<u16>,
    pub codecs: Vec<Codec>,
    pub srtp: Option<SrtpParams>,
    /// Kilobits per second the sender is prepared to use.
    pub bandwidth_kbps: u32,
    /// Frames per second for video, 0 when audio-only.
    pub framerate: u32,
}

impl SessionDescription {
    /// Primary media address, if any candidate was supplied.
    pub fn primary_address(&self) -> Option<&str> {
        self.addresses.first().map(|a| a.as_str())
    }

    /// Primary RTP port, if any candidate was supplied.
    pub fn primary_rtp_port(&self) -> Option<u16> {
        self.rtp_ports.first().copied()
    }

    /// Primary RTCP port, if any candidate was supplied.
    pub fn primary_rtcp_port(&self) -> Option<u16> {
        self.rtcp_ports.first().copied()
    }

    /// True when the description asks to suspend media: the primary
    /// candidate names the null address or port zero.
    pub fn is_hold(&self) -> bool {
        match (self.primary_address(), self.primary_rtp_port()) {
            (Some(addr), Some(port)) => addr == NULL_MEDIA_ADDRESS || port == 0,
            (Some(addr), None) => addr == NULL_MEDIA_ADDRESS,
            (None, Some(port)) => port == 0,
            (None, None) => false,
        }
    }

    /// Copy of this description with the primary candidate nulled out, as
    /// sent in a hold re-INVITE. Secondary candidates are dropped: a hold
    /// offer has nothing to fall back to.
    pub fn to_hold(&self) -> Self {
        let mut held = self.clone();
        held.addresses = vec![NULL_MEDIA_ADDRESS.to_string()];
        held.rtp_ports = vec![0];
        held.rtcp_ports = vec![0];
        held.video_ports = if self.video_ports.is_empty() {
            Vec::new()
        } else {
            vec![0]
        };
        held
    }

    /// Truncate every candidate array to `max` entries.
    pub fn cap_candidates(&mut self, max: usize) {
        self.addresses.truncate(max);
        self.rtp_ports.truncate(max);
        self.rtcp_ports.truncate(max);
        self.video_ports.truncate(max);
    }

    pub fn has_codecs(&self) -> bool {
        !self.codecs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(addr: &str, port: u16) -> SessionDescription {
        SessionDescription {
            addresses: vec![addr.to_string()],
            rtp_ports: vec![port],
            rtcp_ports: vec![port + 1],
            video_ports: Vec::new(),
            codecs: vec![Codec::new("PCMU", 8000, 0)],
            srtp: None,
            bandwidth_kbps: 64,
            framerate: 0,
        }
    }

    #[test]
    fn hold_detected_on_null_address_or_zero_port() {
        assert!(!offer("10.0.0.1", 4000).is_hold());
        assert!(offer(NULL_MEDIA_ADDRESS, 4000).is_hold());
        assert!(offer("10.0.0.1", 0).is_hold());
    }

    #[test]
    fn to_hold_nulls_primary_and_drops_alternates() {
        let mut talking = offer("10.0.0.1", 4000);
        talking.addresses.push("192.168.1.5".to_string());
        talking.rtp_ports.push(4002);
        talking.rtcp_ports.push(4003);

        let held = talking.to_hold();
        assert!(held.is_hold());
        assert_eq!(held.addresses, vec![NULL_MEDIA_ADDRESS.to_string()]);
        assert_eq!(held.rtp_ports, vec![0]);
        // Codec list survives: hold narrows the destination, not the session.
        assert_eq!(held.codecs, talking.codecs);
    }

    #[test]
    fn codec_match_ignores_payload_type() {
        let a = Codec::new("PCMU", 8000, 0);
        let b = Codec::new("pcmu", 8000, 96);
        assert!(a.matches(&b));
        assert!(!a.matches(&Codec::new("PCMA", 8000, 8)));
    }

    #[test]
    fn cap_candidates_truncates_all_arrays() {
        let mut desc = offer("10.0.0.1", 4000);
        for i in 0..5 {
            desc.addresses.push(format!("10.0.0.{}", i + 2));
            desc.rtp_ports.push(5000 + i);
            desc.rtcp_ports.push(5001 + i);
        }
        desc.cap_candidates(2);
        assert_eq!(desc.addresses.len(), 2);
        assert_eq!(desc.rtp_ports.len(), 2);
        assert_eq!(desc.rtcp_ports.len(), 2);
    }
}
