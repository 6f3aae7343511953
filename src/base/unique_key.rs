use std::sync::atomic::{AtomicU64, Ordering};

// Role prefixes. The kick-out API matches on these to identify a session's
// protocol and direction without a global registry.
pub const UKP_GROUP: &str = "GROUP";
pub const UKP_RTMP_PUB: &str = "RTMPPUB";
pub const UKP_RTMP_SUB: &str = "RTMPSUB";
pub const UKP_RTMP_PULL: &str = "RTMPPULL";
pub const UKP_RTMP_PUSH: &str = "RTMPPUSH";
pub const UKP_RTSP_PUB: &str = "RTSPPUB";
pub const UKP_RTSP_SUB: &str = "RTSPSUB";
pub const UKP_FLV_SUB: &str = "FLVSUB";
pub const UKP_TS_SUB: &str = "TSSUB";
pub const UKP_HLS_MUXER: &str = "HLSMUXER";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique key with a role prefix, e.g. `RTMPSUB1A2B3C4D`.
pub fn gen_unique_key(prefix: &str) -> String {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}{id:08X}")
}
