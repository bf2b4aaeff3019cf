//! Outgoing track construction for webrtc-rs
//!
//! Capture happens outside this crate; an application writes encoded
//! samples into the track returned here.

use crate::session::{LocalTrack, TrackKind};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub const STREAM_ID: &str = "pairlink-stream";

pub fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
    }
}

/// Sample-fed local track carrying `track`'s id
pub fn sample_track(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        codec_for(track.kind),
        track.id.clone(),
        STREAM_ID.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::track::track_local::TrackLocal;

    #[test]
    fn test_codec_per_kind() {
        assert_eq!(codec_for(TrackKind::Audio).mime_type, MIME_TYPE_OPUS);
        assert_eq!(codec_for(TrackKind::Video).clock_rate, 90000);
    }

    #[test]
    fn test_sample_track_keeps_id() {
        let local = LocalTrack::screen();
        let track = sample_track(&local);
        assert_eq!(track.id(), local.id);
        assert_eq!(track.stream_id(), STREAM_ID);
    }
}
