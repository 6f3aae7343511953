use std::collections::VecDeque;

use crate::base::AvPacket;

const MAX_QUEUE_SIZE: usize = 128;

/// Bridges RTSP input, where audio and video ride independent timelines, to
/// the single monotonic timeline RTMP/FLV output expects:
///
/// 1. the first packet of either stream anchors the shared timeline; both
///    tracks are rebased against it, so the cross-track offset at stream
///    start is preserved
/// 2. while both queues hold data, the smaller rebased timestamp is emitted,
///    giving non-decreasing output as long as each input is non-decreasing
///
/// A full queue pops its front and emits immediately, so a one-sided stream
/// cannot stall the other indefinitely. Both tracks are assumed present;
/// pure audio or video streams should bypass the queue.
pub struct AvPacketQueue {
    base_ts: i64,
    audio_queue: VecDeque<AvPacket>,
    video_queue: VecDeque<AvPacket>,
}

impl AvPacketQueue {
    pub fn new() -> Self {
        Self {
            base_ts: -1,
            audio_queue: VecDeque::with_capacity(MAX_QUEUE_SIZE),
            video_queue: VecDeque::with_capacity(MAX_QUEUE_SIZE),
        }
    }

    /// Within each stream the caller guarantees non-decreasing timestamps.
    pub fn feed(&mut self, mut pkt: AvPacket, emit: &mut dyn FnMut(AvPacket)) {
        if self.base_ts == -1 {
            self.base_ts = i64::from(pkt.timestamp);
        }
        // a track that started slightly before the anchor clamps to zero
        pkt.timestamp = (i64::from(pkt.timestamp) - self.base_ts).max(0) as u32;

        if pkt.payload_type.is_video() {
            self.video_queue.push_back(pkt);
            if self.video_queue.len() >= MAX_QUEUE_SIZE {
                if let Some(front) = self.video_queue.pop_front() {
                    emit(front);
                }
                return;
            }
        } else {
            self.audio_queue.push_back(pkt);
            if self.audio_queue.len() >= MAX_QUEUE_SIZE {
                if let Some(front) = self.audio_queue.pop_front() {
                    emit(front);
                }
                return;
            }
        }

        while !self.audio_queue.is_empty() && !self.video_queue.is_empty() {
            let audio_ts = self.audio_queue.front().map(|p| p.timestamp);
            let video_ts = self.video_queue.front().map(|p| p.timestamp);
            let (Some(audio_ts), Some(video_ts)) = (audio_ts, video_ts) else {
                break;
            };
            if audio_ts < video_ts {
                if let Some(pkt) = self.audio_queue.pop_front() {
                    emit(pkt);
                }
            } else if let Some(pkt) = self.video_queue.pop_front() {
                emit(pkt);
            }
        }
    }
}

impl Default for AvPacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
