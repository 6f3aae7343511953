// Wire-independent data model shared by every protocol path.

pub mod msg;
pub mod stat;
pub mod unique_key;

pub use msg::{
    AvPacket, AvPacketPayloadType, RtmpHeader, RtmpMsg, RtpPacket, SdpContext,
    RTMP_AAC_PACKET_TYPE_RAW, RTMP_AAC_PACKET_TYPE_SEQ_HEADER, RTMP_AVC_PACKET_TYPE_NALU,
    RTMP_AVC_PACKET_TYPE_SEQ_HEADER, RTMP_CODEC_ID_AVC, RTMP_CODEC_ID_HEVC,
    RTMP_FRAME_TYPE_KEY, RTMP_SOUND_FORMAT_AAC, RTMP_TYPE_ID_AUDIO, RTMP_TYPE_ID_METADATA,
    RTMP_TYPE_ID_VIDEO,
};
pub use stat::{
    SessionEventNotify, ServerStartNotify, StatGroup, StatSession, UpdateNotify,
    AUDIO_CODEC_AAC, VIDEO_CODEC_AVC, VIDEO_CODEC_HEVC,
};
pub use unique_key::{
    gen_unique_key, UKP_FLV_SUB, UKP_GROUP, UKP_HLS_MUXER, UKP_RTMP_PUB, UKP_RTMP_PULL,
    UKP_RTMP_PUSH, UKP_RTMP_SUB, UKP_RTSP_PUB, UKP_RTSP_SUB, UKP_TS_SUB,
};
