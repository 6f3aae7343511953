// Live stream broadcast core.
//
// A process hosts one `ServerManager` owning a map from (app_name, stream_name)
// to `Group`. Protocol listeners hand accepted sessions to the manager, which
// locates or creates the group and attaches them. Inside a group, one input
// session (RTMP publish, RTSP publish, or relay pull) is fanned out to any
// number of RTMP / HTTP-FLV / HTTP-TS / RTSP subscribers and relay-push
// targets, with GOP caching for join-anywhere playback and an optional HLS
// muxer producing MPEG-TS segments and a rolling playlist.
//
// Wire codecs (RTMP chunk reading, RTSP command handling, HTTP request
// parsing) live outside this crate; sessions here are the core-owned shells
// those codecs feed.

pub mod base;
pub mod codec;
pub mod config;
pub mod error;
pub mod group;
pub mod hls;
pub mod manager;
pub mod mpegts;
pub mod relay;
pub mod remux;
pub mod session;

pub use config::Config;
pub use error::{Result, RillError};
pub use group::Group;
pub use manager::ServerManager;
