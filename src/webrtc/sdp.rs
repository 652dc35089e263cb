//! Remote track announcements read from a parsed session description

use webrtc::sdp::description::media::MediaDescription;
use webrtc::sdp::SessionDescription as SdpDescription;

use crate::media::TrackKind;

/// Track the remote side is sending, as announced in its description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedTrack {
    pub kind: TrackKind,
    pub stream_id: String,
    pub track_id: String,
}

/// Tracks the remote sends, in m-line order
///
/// Rejected sections (port 0), sections the remote does not send on and
/// sections without a stream id are skipped.
pub fn announced_tracks(desc: &SdpDescription) -> Vec<AnnouncedTrack> {
    desc.media_descriptions
        .iter()
        .filter_map(announced_track)
        .collect()
}

fn announced_track(media: &MediaDescription) -> Option<AnnouncedTrack> {
    let kind = match media.media_name.media.as_str() {
        "audio" => TrackKind::Audio,
        "video" => TrackKind::Video,
        _ => return None,
    };
    if media.media_name.port.value == 0 {
        return None;
    }
    if media.has_attribute("recvonly") || media.has_attribute("inactive") {
        return None;
    }
    let (stream_id, track_id) = media
        .attribute("msid")
        .flatten()
        .and_then(parse_msid)
        .or_else(|| legacy_msid(media))?;
    Some(AnnouncedTrack {
        kind,
        stream_id,
        track_id,
    })
}

/// `a=ssrc:<ssrc> msid:<stream> <track>`
fn legacy_msid(media: &MediaDescription) -> Option<(String, String)> {
    media
        .attributes
        .iter()
        .filter(|a| a.key == "ssrc")
        .filter_map(|a| a.value.as_deref())
        .find_map(|v| v.split_once(" msid:").and_then(|(_, m)| parse_msid(m)))
}

fn parse_msid(value: &str) -> Option<(String, String)> {
    let mut parts = value.split_whitespace();
    let stream = parts.next()?;
    let track = parts.next()?;
    if stream == "-" {
        return None;
    }
    Some((stream.to_string(), track.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HEADER: &str = "v=0\r\n\
o=- 1 2 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n";

    const MEDIA: &str = "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
a=msid:mic-stream mic-track\r\n\
a=sendrecv\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
a=mid:1\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:2\r\n\
a=msid:screen-stream screen-video\r\n\
a=sendonly\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:3\r\n\
a=ssrc:1234 msid:screen-stream screen-audio\r\n\
a=sendonly\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:4\r\n\
a=msid:old-stream old-video\r\n\
a=inactive\r\n";

    fn parse(media: &str) -> SdpDescription {
        let sdp = format!("{}{}", HEADER, media);
        SdpDescription::unmarshal(&mut Cursor::new(sdp.as_bytes())).unwrap()
    }

    #[test]
    fn test_announced_tracks() {
        let tracks = announced_tracks(&parse(MEDIA));
        assert_eq!(tracks.len(), 3);
        assert_eq!(tracks[0].kind, TrackKind::Audio);
        assert_eq!(tracks[0].stream_id, "mic-stream");
        assert_eq!(tracks[1].kind, TrackKind::Video);
        assert_eq!(tracks[2].track_id, "screen-audio");
        assert_eq!(tracks[2].stream_id, "screen-stream");
    }

    #[test]
    fn test_rejected_section_skipped() {
        let desc = parse("m=audio 0 UDP/TLS/RTP/SAVPF 111\r\na=msid:s t\r\n");
        assert!(announced_tracks(&desc).is_empty());
    }

    #[test]
    fn test_sections_without_stream_skipped() {
        let desc = parse(
            "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=mid:1\r\n\
a=msid:- orphan\r\n\
a=sendonly\r\n",
        );
        assert!(announced_tracks(&desc).is_empty());
    }
}
