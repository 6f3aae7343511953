// Repackaging between message framings: RTMP messages to chunk streams and
// FLV tags, and RTSP-side configs/packets to synthesized RTMP messages.

pub mod amf;
pub mod chunk;
pub mod flv;
pub mod rtsp;

pub use chunk::{make_default_header, message_to_chunks, message_to_chunks_with_size};
pub use flv::{flv_tag_to_rtmp_msg, rtmp_msg_to_flv_tag, FLV_FILE_HEADER};
pub use rtsp::{av_config_to_rtmp_msgs, av_packet_to_rtmp_msg};
