use bytes::{BufMut, BytesMut};
use tracing::{error, warn};

use crate::base::{
    gen_unique_key, RtmpMsg, RTMP_AVC_PACKET_TYPE_NALU, RTMP_AVC_PACKET_TYPE_SEQ_HEADER,
    RTMP_CODEC_ID_AVC, RTMP_FRAME_TYPE_KEY, RTMP_SOUND_FORMAT_AAC, RTMP_TYPE_ID_AUDIO,
    RTMP_TYPE_ID_VIDEO, UKP_HLS_MUXER,
};
use crate::codec::aac::Adts;
use crate::codec::avc;
use crate::hls::{MAX_AUDIO_CACHE_DELAY_BY_AUDIO, MAX_AUDIO_CACHE_DELAY_BY_VIDEO};
use crate::mpegts::{Frame, PID_AUDIO, PID_VIDEO, STREAM_ID_AUDIO, STREAM_ID_VIDEO};

/// Converts RTMP media messages into elementary-stream frames in
/// presentation order: AVC payloads become AnnexB (with synthesized AUD and
/// SPS/PPS placement), AAC payloads are ADTS-framed and batched to amortize
/// TS overhead.
///
/// Emitted frames carry `cc = 0`; continuity counters belong to the muxer.
pub struct Streamer {
    unique_key: String,
    spspps: Option<Vec<u8>>, // AnnexB
    adts: Adts,
    audio_cache: Option<BytesMut>,
    audio_cache_first_pts: u64,
}

impl Streamer {
    pub fn new() -> Self {
        Self {
            unique_key: gen_unique_key(UKP_HLS_MUXER),
            spspps: None,
            adts: Adts::default(),
            audio_cache: None,
            audio_cache_first_pts: 0,
        }
    }

    pub fn feed_rtmp_message(&mut self, msg: &RtmpMsg, out: &mut Vec<Frame>) {
        match msg.header.msg_type_id {
            RTMP_TYPE_ID_AUDIO => self.feed_audio(msg, out),
            RTMP_TYPE_ID_VIDEO => self.feed_video(msg, out),
            _ => {}
        }
    }

    pub fn audio_seq_header_cached(&self) -> bool {
        self.adts.has_inited()
    }

    pub fn video_seq_header_cached(&self) -> bool {
        self.spspps.is_some()
    }

    pub fn audio_cache_empty(&self) -> bool {
        self.audio_cache.is_none()
    }

    fn feed_video(&mut self, msg: &RtmpMsg, out: &mut Vec<Frame>) {
        let payload = &msg.payload;
        if payload.len() < 5 {
            error!(unique_key = %self.unique_key, len = payload.len(), "invalid video message length");
            return;
        }
        if payload[0] & 0x0F != RTMP_CODEC_ID_AVC {
            return;
        }

        let frame_type = payload[0] >> 4;
        let packet_type = payload[1];

        if frame_type == RTMP_FRAME_TYPE_KEY && packet_type == RTMP_AVC_PACKET_TYPE_SEQ_HEADER {
            match avc::sps_pps_seq_header_to_annexb(payload) {
                Ok(annexb) => self.spspps = Some(annexb),
                Err(e) => {
                    error!(unique_key = %self.unique_key, err = %e, "cache spspps failed")
                }
            }
            return;
        }

        let cts = u32::from(payload[2]) << 16 | u32::from(payload[3]) << 8 | u32::from(payload[4]);

        let mut aud_sent = false;
        let mut spspps_sent = false;
        let mut annexb = BytesMut::with_capacity(payload.len() + 64);

        // a message may hold several length-prefixed NALUs
        let mut i = 5usize;
        while i != payload.len() {
            if i + 4 > payload.len() {
                error!(unique_key = %self.unique_key, i, len = payload.len(), "bad nalu length prefix");
                return;
            }
            let nal_len = usize::from(payload[i]) << 24
                | usize::from(payload[i + 1]) << 16
                | usize::from(payload[i + 2]) << 8
                | usize::from(payload[i + 3]);
            i += 4;
            if nal_len == 0 || i + nal_len > payload.len() {
                error!(unique_key = %self.unique_key, i, nal_len, len = payload.len(), "bad nalu length prefix");
                return;
            }

            let nalu_type = avc::parse_nalu_type(payload[i]);

            // in-band SPS/PPS were cached from the seq header; AUDs are
            // synthesized here, so the original ones are filtered out
            if nalu_type == avc::NALU_TYPE_SPS
                || nalu_type == avc::NALU_TYPE_PPS
                || nalu_type == avc::NALU_TYPE_AUD
            {
                i += nal_len;
                continue;
            }

            if !aud_sent
                && matches!(
                    nalu_type,
                    avc::NALU_TYPE_SLICE | avc::NALU_TYPE_IDR_SLICE | avc::NALU_TYPE_SEI
                )
            {
                annexb.put_slice(&avc::AUD_NALU);
                aud_sent = true;
            }

            match nalu_type {
                avc::NALU_TYPE_SLICE => spspps_sent = false,
                avc::NALU_TYPE_IDR_SLICE => {
                    if !spspps_sent {
                        match &self.spspps {
                            Some(spspps) => annexb.put_slice(spspps),
                            None => {
                                warn!(unique_key = %self.unique_key, "append spspps but not cached yet");
                                return;
                            }
                        }
                    }
                    spspps_sent = true;
                }
                _ => {}
            }

            if annexb.is_empty() {
                annexb.put_slice(&avc::NALU_START_CODE_4);
            } else {
                annexb.put_slice(&avc::NALU_START_CODE_3);
            }
            annexb.put_slice(&payload[i..i + nal_len]);
            i += nal_len;
        }

        let dts = u64::from(msg.header.timestamp_abs) * 90;

        if self.audio_cache.is_some()
            && self.audio_cache_first_pts + MAX_AUDIO_CACHE_DELAY_BY_VIDEO < dts
        {
            self.flush_audio(out);
        }

        out.push(Frame {
            cc: 0,
            dts,
            pts: dts + u64::from(cts) * 90,
            key: frame_type == RTMP_FRAME_TYPE_KEY && packet_type == RTMP_AVC_PACKET_TYPE_NALU,
            pid: PID_VIDEO,
            sid: STREAM_ID_VIDEO,
            raw: annexb,
        });
    }

    fn feed_audio(&mut self, msg: &RtmpMsg, out: &mut Vec<Frame>) {
        let payload = &msg.payload;
        if payload.len() < 3 {
            error!(unique_key = %self.unique_key, len = payload.len(), "invalid audio message length");
            return;
        }
        if payload[0] >> 4 != RTMP_SOUND_FORMAT_AAC {
            return;
        }

        if payload[1] == 0 {
            if let Err(e) = self.adts.init_with_asc(&payload[2..]) {
                error!(unique_key = %self.unique_key, err = %e, "cache aac seq header failed");
            }
            return;
        }

        if !self.adts.has_inited() {
            warn!(unique_key = %self.unique_key, "audio message before aac seq header");
            return;
        }

        let pts = u64::from(msg.header.timestamp_abs) * 90;

        if self.audio_cache.is_some()
            && self.audio_cache_first_pts + MAX_AUDIO_CACHE_DELAY_BY_AUDIO < pts
        {
            self.flush_audio(out);
        }

        if self.audio_cache.is_none() {
            self.audio_cache_first_pts = pts;
            self.audio_cache = Some(BytesMut::with_capacity(4096));
        }
        let Some(cache) = self.audio_cache.as_mut() else {
            return;
        };

        // infallible: has_inited checked above
        if let Ok(header) = self.adts.calc_adts_header((payload.len() - 2) as u16) {
            cache.put_slice(&header);
            cache.put_slice(&payload[2..]);
        }
    }

    /// Emit the batched audio as one frame. Called when a threshold trips,
    /// when a fragment rotates, and on teardown.
    pub fn flush_audio(&mut self, out: &mut Vec<Frame>) {
        let Some(cache) = self.audio_cache.take() else {
            return;
        };
        out.push(Frame {
            cc: 0,
            dts: self.audio_cache_first_pts,
            pts: self.audio_cache_first_pts,
            key: false,
            pid: PID_AUDIO,
            sid: STREAM_ID_AUDIO,
            raw: cache,
        });
    }
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::RtmpHeader;
    use bytes::Bytes;

    const SPS_720P: [u8; 24] = [
        0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10, 0x00, 0x00,
        0x3E, 0x90, 0x00, 0x0E, 0xA6, 0x00, 0xF1, 0x83, 0x19, 0x60,
    ];
    const PPS: [u8; 4] = [0x68, 0xEB, 0xE3, 0xCB];

    fn video_seq_header_msg() -> RtmpMsg {
        let mut p = vec![0x17, 0x00, 0x00, 0x00, 0x00];
        p.extend_from_slice(&[0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1]);
        p.extend_from_slice(&(SPS_720P.len() as u16).to_be_bytes());
        p.extend_from_slice(&SPS_720P);
        p.push(0x01);
        p.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        p.extend_from_slice(&PPS);
        msg(RTMP_TYPE_ID_VIDEO, 0, p)
    }

    fn idr_msg(ts: u32) -> RtmpMsg {
        let nalu = [0x65u8, 0x88, 0x80, 0x10];
        let mut p = vec![0x17, 0x01, 0x00, 0x00, 0x00];
        p.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        p.extend_from_slice(&nalu);
        msg(RTMP_TYPE_ID_VIDEO, ts, p)
    }

    fn inter_msg(ts: u32) -> RtmpMsg {
        let nalu = [0x41u8, 0x9a, 0x00];
        let mut p = vec![0x27, 0x01, 0x00, 0x00, 0x00];
        p.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        p.extend_from_slice(&nalu);
        msg(RTMP_TYPE_ID_VIDEO, ts, p)
    }

    fn aac_seq_header_msg() -> RtmpMsg {
        msg(RTMP_TYPE_ID_AUDIO, 0, vec![0xaf, 0x00, 0x12, 0x10])
    }

    fn aac_raw_msg(ts: u32) -> RtmpMsg {
        msg(RTMP_TYPE_ID_AUDIO, ts, vec![0xaf, 0x01, 0x21, 0x2b, 0x94, 0xa5])
    }

    fn msg(type_id: u8, ts: u32, payload: Vec<u8>) -> RtmpMsg {
        RtmpMsg {
            header: RtmpHeader {
                msg_type_id: type_id,
                msg_len: payload.len() as u32,
                timestamp_abs: ts,
                ..Default::default()
            },
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn caches_seq_headers_without_emitting() {
        let mut s = Streamer::new();
        let mut out = Vec::new();
        s.feed_rtmp_message(&video_seq_header_msg(), &mut out);
        s.feed_rtmp_message(&aac_seq_header_msg(), &mut out);
        assert!(out.is_empty());
        assert!(s.video_seq_header_cached());
        assert!(s.audio_seq_header_cached());
    }

    #[test]
    fn idr_frame_gets_aud_and_spspps_prefix() {
        let mut s = Streamer::new();
        let mut out = Vec::new();
        s.feed_rtmp_message(&video_seq_header_msg(), &mut out);
        s.feed_rtmp_message(&idr_msg(40), &mut out);

        assert_eq!(out.len(), 1);
        let frame = &out[0];
        assert!(frame.key);
        assert_eq!(frame.pid, PID_VIDEO);
        assert_eq!(frame.dts, 40 * 90);

        // AUD first, then SPS, PPS, then the IDR slice with a 3-byte start code
        assert!(frame.raw.starts_with(&avc::AUD_NALU));
        let after_aud = &frame.raw[avc::AUD_NALU.len()..];
        assert!(after_aud.starts_with(&avc::NALU_START_CODE_4));
        assert_eq!(&after_aud[4..4 + SPS_720P.len()], &SPS_720P);
        let tail_start = frame.raw.len() - 3 - 4;
        assert_eq!(&frame.raw[tail_start..tail_start + 3], &avc::NALU_START_CODE_3);
        assert_eq!(frame.raw[tail_start + 3], 0x65);
    }

    #[test]
    fn idr_before_seq_header_is_dropped() {
        let mut s = Streamer::new();
        let mut out = Vec::new();
        s.feed_rtmp_message(&idr_msg(0), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn inter_frame_has_no_spspps() {
        let mut s = Streamer::new();
        let mut out = Vec::new();
        s.feed_rtmp_message(&video_seq_header_msg(), &mut out);
        s.feed_rtmp_message(&inter_msg(80), &mut out);
        assert_eq!(out.len(), 1);
        assert!(!out[0].key);
        assert!(out[0].raw.starts_with(&avc::AUD_NALU));
        // AUD then directly the slice
        assert_eq!(out[0].raw[avc::AUD_NALU.len() + 3], 0x41);
    }

    #[test]
    fn audio_is_batched_until_the_span_threshold() {
        let mut s = Streamer::new();
        let mut out = Vec::new();
        s.feed_rtmp_message(&aac_seq_header_msg(), &mut out);
        s.feed_rtmp_message(&aac_raw_msg(0), &mut out);
        s.feed_rtmp_message(&aac_raw_msg(23), &mut out);
        assert!(out.is_empty());
        assert!(!s.audio_cache_empty());

        // 200ms later: exceeds the 150ms audio span threshold, batch flushes
        s.feed_rtmp_message(&aac_raw_msg(200), &mut out);
        assert_eq!(out.len(), 1);
        let frame = &out[0];
        assert_eq!(frame.pid, PID_AUDIO);
        assert_eq!(frame.dts, 0);
        // two ADTS-framed payloads of 7 + 4 bytes each
        assert_eq!(frame.raw.len(), 2 * (7 + 4));
        assert_eq!(frame.raw[0], 0xFF);
        assert_eq!(frame.raw[1], 0xF1);
    }

    #[test]
    fn video_arrival_flushes_stale_audio_first() {
        let mut s = Streamer::new();
        let mut out = Vec::new();
        s.feed_rtmp_message(&video_seq_header_msg(), &mut out);
        s.feed_rtmp_message(&aac_seq_header_msg(), &mut out);
        s.feed_rtmp_message(&aac_raw_msg(0), &mut out);
        s.feed_rtmp_message(&idr_msg(400), &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].pid, PID_AUDIO);
        assert_eq!(out[1].pid, PID_VIDEO);
        assert!(out[0].dts <= out[1].dts);
    }

    #[test]
    fn audio_before_seq_header_is_dropped() {
        let mut s = Streamer::new();
        let mut out = Vec::new();
        s.feed_rtmp_message(&aac_raw_msg(0), &mut out);
        assert!(out.is_empty());
        assert!(s.audio_cache_empty());
    }
}
