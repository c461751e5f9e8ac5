//! SDP generation and parsing for the two-m-line (audio + video) sessions
//! used by tutoring calls.
//!
//! Generation mirrors what a browser produces for `addTransceiver(audio)` +
//! `addTransceiver(video)`: one `sendrecv` section per kind, shared ICE
//! credentials (BUNDLE), an SRTP crypto line and `a=msid` for every section
//! that carries a track. Parsing extracts just enough to drive negotiation.

use anyhow::{bail, Context, Result};
use base64::Engine;

use super::media::TrackKind;

/// One media section to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    pub kind: TrackKind,
    pub mid: String,
    /// `(stream id, track id)` when a track is attached to the sender.
    pub msid: Option<(String, String)>,
    /// Capture hint for screen tracks (`monitor`, `window`, `browser`).
    pub display_surface: Option<String>,
}

/// Session-level parameters shared by every section.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: u64,
    pub version: u64,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// `actpass` in offers, `active` in answers.
    pub setup: &'static str,
}

impl SessionParams {
    /// Fresh random ICE credentials and session id.
    pub fn generate(setup: &'static str) -> Result<Self> {
        let id_bytes: [u8; 8] = rand_bytes()?;
        Ok(Self {
            // Keep the id within i64 range as browsers do.
            session_id: u64::from_be_bytes(id_bytes) >> 1,
            version: 2,
            ice_ufrag: generate_ice_ufrag()?,
            ice_pwd: generate_ice_pwd()?,
            setup,
        })
    }
}

/// Build a full session description.
pub fn build_description(params: &SessionParams, lines: &[MediaLine]) -> Result<String> {
    if lines.is_empty() {
        bail!("a session description needs at least one media section");
    }
    let crypto_key = generate_srtp_key()?;
    let mids: Vec<&str> = lines.iter().map(|l| l.mid.as_str()).collect();

    let mut sdp = String::new();

    // Session level
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o=- {} {} IN IP4 127.0.0.1\r\n", params.session_id, params.version));
    sdp.push_str("s=-\r\n");
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(&format!("a=group:BUNDLE {}\r\n", mids.join(" ")));
    sdp.push_str("a=msid-semantic: WMS\r\n");

    for line in lines {
        match line.kind {
            TrackKind::Audio => {
                sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n");
            }
            TrackKind::Video => {
                sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96 102\r\n");
            }
        }
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str(&format!("a=ice-ufrag:{}\r\n", params.ice_ufrag));
        sdp.push_str(&format!("a=ice-pwd:{}\r\n", params.ice_pwd));
        sdp.push_str("a=ice-options:trickle\r\n");
        sdp.push_str(&format!("a=setup:{}\r\n", params.setup));
        sdp.push_str(&format!("a=mid:{}\r\n", line.mid));
        sdp.push_str("a=sendrecv\r\n");
        if let Some((stream_id, track_id)) = &line.msid {
            sdp.push_str(&format!("a=msid:{} {}\r\n", stream_id, track_id));
        }
        if let Some(surface) = &line.display_surface {
            sdp.push_str(&format!("a=x-display-surface:{}\r\n", surface));
        }
        sdp.push_str("a=rtcp-mux\r\n");
        match line.kind {
            TrackKind::Audio => {
                sdp.push_str("a=rtpmap:111 opus/48000/2\r\n");
                sdp.push_str("a=fmtp:111 minptime=10;useinbandfec=1\r\n");
                sdp.push_str("a=rtpmap:0 PCMU/8000\r\n");
            }
            TrackKind::Video => {
                sdp.push_str("a=rtpmap:96 VP8/90000\r\n");
                sdp.push_str("a=rtcp-fb:96 nack pli\r\n");
                sdp.push_str("a=rtpmap:102 H264/90000\r\n");
                sdp.push_str("a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n");
            }
        }
        sdp.push_str(&format!("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:{}|2^31\r\n", crypto_key));
    }

    Ok(sdp)
}

// ---- Parsing ----

/// One parsed media section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: TrackKind,
    pub mid: String,
    pub track_id: Option<String>,
    pub display_surface: Option<String>,
}

/// What negotiation needs from a remote description.
#[derive(Debug, Clone)]
pub struct SdpSummary {
    pub ice_ufrag: String,
    pub sections: Vec<MediaSection>,
}

impl SdpSummary {
    #[cfg(test)]
    pub fn section(&self, mid: &str) -> Option<&MediaSection> {
        self.sections.iter().find(|s| s.mid == mid)
    }
}

/// Parse a session description, rejecting anything a browser would refuse.
pub fn parse_description(sdp: &str) -> Result<SdpSummary> {
    let mut lines = sdp.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some("v=0") => {}
        other => bail!("session description must start with v=0, got {:?}", other),
    }

    let mut session_ufrag = None;
    let mut session_pwd = None;
    let mut sections: Vec<(MediaSection, Option<String>, Option<String>)> = Vec::new();

    for line in lines {
        if let Some(rest) = line.strip_prefix("m=") {
            let kind = match rest.split_whitespace().next() {
                Some("audio") => TrackKind::Audio,
                Some("video") => TrackKind::Video,
                other => bail!("unsupported media section {:?}", other),
            };
            sections.push((
                MediaSection {
                    kind,
                    mid: String::new(),
                    track_id: None,
                    display_surface: None,
                },
                None,
                None,
            ));
            continue;
        }

        let current = sections.last_mut();
        if let Some(val) = line.strip_prefix("a=ice-ufrag:") {
            match current {
                Some((_, ufrag, _)) => *ufrag = Some(val.to_string()),
                None => session_ufrag = Some(val.to_string()),
            }
        } else if let Some(val) = line.strip_prefix("a=ice-pwd:") {
            match current {
                Some((_, _, pwd)) => *pwd = Some(val.to_string()),
                None => session_pwd = Some(val.to_string()),
            }
        } else if let Some(val) = line.strip_prefix("a=mid:") {
            if let Some((section, _, _)) = current {
                section.mid = val.to_string();
            }
        } else if let Some(val) = line.strip_prefix("a=msid:") {
            if let Some((section, _, _)) = current {
                let mut parts = val.split_whitespace();
                let _stream = parts.next();
                section.track_id = parts.next().map(str::to_string);
            }
        } else if let Some(val) = line.strip_prefix("a=x-display-surface:") {
            if let Some((section, _, _)) = current {
                section.display_surface = Some(val.to_string());
            }
        }
    }

    if sections.is_empty() {
        bail!("session description has no media sections");
    }

    let mut ice_ufrag = session_ufrag;
    let mut ice_pwd = session_pwd;
    let mut parsed = Vec::with_capacity(sections.len());
    for (i, (section, ufrag, pwd)) in sections.into_iter().enumerate() {
        if section.mid.is_empty() {
            bail!("media section {} has no a=mid", i);
        }
        if ice_ufrag.is_none() {
            ice_ufrag = ufrag;
        }
        if ice_pwd.is_none() {
            ice_pwd = pwd;
        }
        parsed.push(section);
    }

    if ice_pwd.is_none() {
        bail!("session description has no ice-pwd");
    }
    Ok(SdpSummary {
        ice_ufrag: ice_ufrag.context("session description has no ice-ufrag")?,
        sections: parsed,
    })
}

// ---- Random material ----

/// Generate a random 4-character ICE ufrag.
pub fn generate_ice_ufrag() -> Result<String> {
    let bytes: [u8; 2] = rand_bytes()?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Generate a random 24-character ICE password using only hex characters.
///
/// RFC 8445 requires ice-pwd to be 22-256 ice-chars; hex avoids `+`, `/`
/// and `=` which some SDP parsers reject.
pub fn generate_ice_pwd() -> Result<String> {
    let bytes: [u8; 12] = rand_bytes()?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Generate a random 30-byte base64 SRTP master key.
fn generate_srtp_key() -> Result<String> {
    let bytes: [u8; 30] = rand_bytes()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Cryptographically secure random bytes via the OS CSPRNG.
fn rand_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow::anyhow!("OS CSPRNG failed: {}", e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines() -> Vec<MediaLine> {
        vec![
            MediaLine {
                kind: TrackKind::Audio,
                mid: "0".into(),
                msid: Some(("stream-a".into(), "mic-1".into())),
                display_surface: None,
            },
            MediaLine {
                kind: TrackKind::Video,
                mid: "1".into(),
                msid: Some(("stream-a".into(), "screen-1".into())),
                display_surface: Some("monitor".into()),
            },
        ]
    }

    #[test]
    fn test_generated_description_parses() {
        let params = SessionParams::generate("actpass").unwrap();
        let sdp = build_description(&params, &lines()).unwrap();
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("a=group:BUNDLE 0 1\r\n"));
        assert!(sdp.contains("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:"));

        let summary = parse_description(&sdp).unwrap();
        assert_eq!(summary.ice_ufrag, params.ice_ufrag);
        assert_eq!(summary.sections.len(), 2);
        let video = summary.section("1").unwrap();
        assert_eq!(video.kind, TrackKind::Video);
        assert_eq!(video.track_id.as_deref(), Some("screen-1"));
        assert_eq!(video.display_surface.as_deref(), Some("monitor"));
        assert!(summary.section("0").unwrap().display_surface.is_none());
    }

    #[test]
    fn test_section_without_track_has_no_msid() {
        let params = SessionParams::generate("active").unwrap();
        let mut l = lines();
        l[1].msid = None;
        l[1].display_surface = None;
        let summary = parse_description(&build_description(&params, &l).unwrap()).unwrap();
        assert!(summary.section("1").unwrap().track_id.is_none());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_description("").is_err());
        assert!(parse_description("hello world").is_err());
        assert!(parse_description("v=0\r\ns=-\r\n").is_err());
        // media section without mid
        assert!(parse_description("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=ice-ufrag:ab\r\na=ice-pwd:cd\r\n").is_err());
        // no ICE credentials
        assert!(parse_description("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n").is_err());
    }

    #[test]
    fn test_ice_credentials_format() {
        let ufrag = generate_ice_ufrag().unwrap();
        let pwd = generate_ice_pwd().unwrap();
        assert_eq!(ufrag.len(), 4);
        assert_eq!(pwd.len(), 24);
        assert!(pwd.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
