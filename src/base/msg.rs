use bytes::Bytes;

// RTMP message type ids.
pub const RTMP_TYPE_ID_AUDIO: u8 = 8;
pub const RTMP_TYPE_ID_VIDEO: u8 = 9;
pub const RTMP_TYPE_ID_METADATA: u8 = 18;

// First-byte fields of FLV/RTMP media payloads.
pub const RTMP_FRAME_TYPE_KEY: u8 = 1;
pub const RTMP_CODEC_ID_AVC: u8 = 7;
pub const RTMP_CODEC_ID_HEVC: u8 = 12;
pub const RTMP_AVC_PACKET_TYPE_SEQ_HEADER: u8 = 0;
pub const RTMP_AVC_PACKET_TYPE_NALU: u8 = 1;
pub const RTMP_SOUND_FORMAT_AAC: u8 = 10;
pub const RTMP_AAC_PACKET_TYPE_SEQ_HEADER: u8 = 0;
pub const RTMP_AAC_PACKET_TYPE_RAW: u8 = 1;

// Chunk stream ids used when re-emitting messages downstream.
pub const CSID_AMF: u32 = 5;
pub const CSID_AUDIO: u32 = 6;
pub const CSID_VIDEO: u32 = 7;

// Message stream id carried on outgoing media messages.
pub const MSID1: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtmpHeader {
    pub csid: u32,
    pub msg_len: u32,
    pub msg_type_id: u8,
    pub msg_stream_id: u32,
    /// Absolute timestamp in milliseconds.
    pub timestamp_abs: u32,
}

/// One demultiplexed RTMP message. `payload` is the tag body without any
/// chunking artifacts; ownership is released to the group on delivery.
#[derive(Debug, Clone)]
pub struct RtmpMsg {
    pub header: RtmpHeader,
    pub payload: Bytes,
}

impl RtmpMsg {
    pub fn is_metadata(&self) -> bool {
        self.header.msg_type_id == RTMP_TYPE_ID_METADATA
    }

    pub fn is_aac_seq_header(&self) -> bool {
        self.header.msg_type_id == RTMP_TYPE_ID_AUDIO
            && self.payload.len() >= 2
            && self.payload[0] >> 4 == RTMP_SOUND_FORMAT_AAC
            && self.payload[1] == RTMP_AAC_PACKET_TYPE_SEQ_HEADER
    }

    pub fn is_avc_key_seq_header(&self) -> bool {
        self.header.msg_type_id == RTMP_TYPE_ID_VIDEO
            && self.payload.len() >= 2
            && self.payload[0] == (RTMP_FRAME_TYPE_KEY << 4 | RTMP_CODEC_ID_AVC)
            && self.payload[1] == RTMP_AVC_PACKET_TYPE_SEQ_HEADER
    }

    pub fn is_hevc_key_seq_header(&self) -> bool {
        self.header.msg_type_id == RTMP_TYPE_ID_VIDEO
            && self.payload.len() >= 2
            && self.payload[0] == (RTMP_FRAME_TYPE_KEY << 4 | RTMP_CODEC_ID_HEVC)
            && self.payload[1] == RTMP_AVC_PACKET_TYPE_SEQ_HEADER
    }

    /// AVC or HEVC decoder-config message.
    pub fn is_video_key_seq_header(&self) -> bool {
        self.is_avc_key_seq_header() || self.is_hevc_key_seq_header()
    }

    pub fn is_avc_key_nalu(&self) -> bool {
        self.header.msg_type_id == RTMP_TYPE_ID_VIDEO
            && self.payload.len() >= 2
            && self.payload[0] == (RTMP_FRAME_TYPE_KEY << 4 | RTMP_CODEC_ID_AVC)
            && self.payload[1] == RTMP_AVC_PACKET_TYPE_NALU
    }

    pub fn is_hevc_key_nalu(&self) -> bool {
        self.header.msg_type_id == RTMP_TYPE_ID_VIDEO
            && self.payload.len() >= 2
            && self.payload[0] == (RTMP_FRAME_TYPE_KEY << 4 | RTMP_CODEC_ID_HEVC)
            && self.payload[1] == RTMP_AVC_PACKET_TYPE_NALU
    }

    /// Key frame carrying coded picture data (not a seq header).
    pub fn is_video_key_nalu(&self) -> bool {
        self.is_avc_key_nalu() || self.is_hevc_key_nalu()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvPacketPayloadType {
    Aac,
    Avc,
    Hevc,
}

impl AvPacketPayloadType {
    pub fn is_video(self) -> bool {
        matches!(self, Self::Avc | Self::Hevc)
    }
}

/// A depacketized audio or video access unit handed over by an RTSP ingress.
/// `timestamp` has already been rebased from the RTP clock to milliseconds.
#[derive(Debug, Clone)]
pub struct AvPacket {
    pub payload_type: AvPacketPayloadType,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// A raw RTP packet tunneled from an RTSP publisher to RTSP subscribers.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub raw: Bytes,
}

/// Track layout parsed from an RTSP publisher's SDP, consulted when routing
/// RTP packets to subscriber tracks.
#[derive(Debug, Clone, Default)]
pub struct SdpContext {
    pub audio_payload_type: Option<u8>,
    pub video_payload_type: Option<u8>,
    pub raw_sdp: Bytes,
}

impl SdpContext {
    pub fn is_audio(&self, payload_type: u8) -> bool {
        self.audio_payload_type == Some(payload_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(type_id: u8, payload: &[u8]) -> RtmpMsg {
        RtmpMsg {
            header: RtmpHeader {
                msg_type_id: type_id,
                msg_len: payload.len() as u32,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn classifies_audio_payloads() {
        assert!(msg(RTMP_TYPE_ID_AUDIO, &[0xaf, 0x00, 0x12, 0x10]).is_aac_seq_header());
        assert!(!msg(RTMP_TYPE_ID_AUDIO, &[0xaf, 0x01, 0x00]).is_aac_seq_header());
        // MP3 sound format is not AAC
        assert!(!msg(RTMP_TYPE_ID_AUDIO, &[0x2f, 0x00]).is_aac_seq_header());
    }

    #[test]
    fn classifies_video_payloads() {
        assert!(msg(RTMP_TYPE_ID_VIDEO, &[0x17, 0x00, 0, 0, 0]).is_avc_key_seq_header());
        assert!(msg(RTMP_TYPE_ID_VIDEO, &[0x17, 0x00, 0, 0, 0]).is_video_key_seq_header());
        assert!(msg(RTMP_TYPE_ID_VIDEO, &[0x1c, 0x00, 0, 0, 0]).is_hevc_key_seq_header());
        assert!(msg(RTMP_TYPE_ID_VIDEO, &[0x17, 0x01, 0, 0, 0]).is_video_key_nalu());
        // inter frame is neither key NALU nor seq header
        let inter = msg(RTMP_TYPE_ID_VIDEO, &[0x27, 0x01, 0, 0, 0]);
        assert!(!inter.is_video_key_nalu());
        assert!(!inter.is_video_key_seq_header());
    }

    #[test]
    fn short_payload_never_matches() {
        assert!(!msg(RTMP_TYPE_ID_VIDEO, &[0x17]).is_video_key_seq_header());
        assert!(!msg(RTMP_TYPE_ID_AUDIO, &[]).is_aac_seq_header());
    }
}
