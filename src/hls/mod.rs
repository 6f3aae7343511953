// RTMP -> MPEG-TS remux: the streamer converts messages to AnnexB/ADTS
// elementary frames, the muxer segments them into .ts files and maintains
// the rolling playlist.

pub mod fragment;
pub mod muxer;
pub mod streamer;

pub use muxer::{HlsMuxer, MuxerConfig, TsOutput};
pub use streamer::Streamer;

/// Flush the audio batch once a video frame runs this far (90 kHz units)
/// past the batch's first timestamp.
pub(crate) const MAX_AUDIO_CACHE_DELAY_BY_VIDEO: u64 = 300 * 90;
/// Flush once the batch itself spans this much audio (90 kHz units).
pub(crate) const MAX_AUDIO_CACHE_DELAY_BY_AUDIO: u64 = 150 * 90;
