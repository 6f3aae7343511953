use serde::Serialize;

pub const AUDIO_CODEC_AAC: &str = "AAC";
pub const VIDEO_CODEC_AVC: &str = "H264";
pub const VIDEO_CODEC_HEVC: &str = "H265";

/// Per-session counters surfaced to the stat API and liveness sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatSession {
    pub protocol: String,
    pub session_id: String,
    pub start_time: String,
    pub remote_addr: String,
    pub read_bytes_sum: u64,
    pub wrote_bytes_sum: u64,
    pub bitrate_kbitps: u32,
    pub read_bitrate_kbitps: u32,
    pub write_bitrate_kbitps: u32,
}

/// Aggregate view of one group, as returned by the stat API and carried in
/// periodic update notifications.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatGroup {
    pub app_name: String,
    pub stream_name: String,
    pub audio_codec: String,
    pub video_codec: String,
    pub video_width: u32,
    pub video_height: u32,
    #[serde(rename = "pub")]
    pub stat_pub: Option<StatSession>,
    pub pull: Option<StatSession>,
    pub subs: Vec<StatSession>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStartNotify {
    pub server_id: String,
    pub start_time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateNotify {
    pub server_id: String,
    pub groups: Vec<StatGroup>,
}

/// Payload for pub_start/pub_stop/sub_start/sub_stop events.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEventNotify {
    pub server_id: String,
    pub app_name: String,
    pub stream_name: String,
    pub protocol: String,
    pub session_id: String,
    pub remote_addr: String,
}
