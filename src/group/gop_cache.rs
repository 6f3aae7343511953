use bytes::Bytes;
use tracing::debug;

use crate::base::{RtmpHeader, RtmpMsg, RTMP_TYPE_ID_AUDIO, RTMP_TYPE_ID_METADATA, RTMP_TYPE_ID_VIDEO};
use crate::remux::{message_to_chunks, rtmp_msg_to_flv_tag};

/// Memoized message -> chunk-stream conversion. A group with only an input
/// and no RTMP consumers never pays for chunking; a group with many pays
/// once.
pub struct LazyChunks<'a> {
    msg: &'a RtmpMsg,
    header: &'a RtmpHeader,
    chunks: Option<Bytes>,
}

impl<'a> LazyChunks<'a> {
    pub fn new(msg: &'a RtmpMsg, header: &'a RtmpHeader) -> Self {
        Self {
            msg,
            header,
            chunks: None,
        }
    }

    pub fn get(&mut self) -> Bytes {
        self.chunks
            .get_or_insert_with(|| message_to_chunks(&self.msg.payload, self.header))
            .clone()
    }
}

/// Memoized message -> FLV tag conversion, same single-shot contract.
pub struct LazyFlvTag<'a> {
    msg: &'a RtmpMsg,
    tag: Option<Bytes>,
}

impl<'a> LazyFlvTag<'a> {
    pub fn new(msg: &'a RtmpMsg) -> Self {
        Self { msg, tag: None }
    }

    pub fn get(&mut self) -> Bytes {
        self.tag
            .get_or_insert_with(|| rtmp_msg_to_flv_tag(self.msg))
            .clone()
    }
}

#[derive(Default)]
struct Gop {
    data: Vec<Bytes>,
}

impl Gop {
    fn feed(&mut self, payload: Bytes) {
        self.data.push(payload);
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

/// Ring of the most recent complete GOPs in pre-serialized form, so fresh
/// subscribers start from a key frame without waiting for the next one.
///
/// The ring holds `gop_num + 1` slots; one is the sentinel separating
/// `first` from `last`, so at most `gop_num` GOPs are retained.
pub struct GopCache {
    t: &'static str,
    unique_key: String,
    pub metadata: Option<Bytes>,
    pub video_seq_header: Option<Bytes>,
    pub aac_seq_header: Option<Bytes>,
    gop_ring: Vec<Gop>,
    gop_ring_first: usize,
    gop_ring_last: usize,
    gop_size: usize,
}

impl GopCache {
    pub fn new(t: &'static str, unique_key: &str, gop_num: usize) -> Self {
        let gop_size = gop_num + 1;
        Self {
            t,
            unique_key: unique_key.to_string(),
            metadata: None,
            video_seq_header: None,
            aac_seq_header: None,
            gop_ring: std::iter::repeat_with(Gop::default).take(gop_size).collect(),
            gop_ring_first: 0,
            gop_ring_last: 0,
            gop_size,
        }
    }

    /// Classify and cache one message. `lazy` yields the serialized bytes on
    /// demand; it is invoked only when the message is actually retained.
    pub fn feed(&mut self, msg: &RtmpMsg, lazy: &mut dyn FnMut() -> Bytes) {
        match msg.header.msg_type_id {
            RTMP_TYPE_ID_METADATA => {
                let data = lazy();
                debug!(unique_key = %self.unique_key, t = self.t, size = data.len(), "cache metadata");
                self.metadata = Some(data);
                return;
            }
            RTMP_TYPE_ID_AUDIO => {
                if msg.is_aac_seq_header() {
                    let data = lazy();
                    debug!(unique_key = %self.unique_key, t = self.t, size = data.len(), "cache aac seq header");
                    self.aac_seq_header = Some(data);
                    return;
                }
            }
            RTMP_TYPE_ID_VIDEO => {
                if msg.is_video_key_seq_header() {
                    let data = lazy();
                    debug!(unique_key = %self.unique_key, t = self.t, size = data.len(), "cache video seq header");
                    self.video_seq_header = Some(data);
                    return;
                }
            }
            _ => {}
        }

        if self.gop_size > 1 {
            if msg.is_video_key_nalu() {
                self.feed_new_gop(lazy());
            } else {
                self.feed_last_gop(lazy);
            }
        }
    }

    pub fn gop_count(&self) -> usize {
        (self.gop_ring_last + self.gop_size - self.gop_ring_first) % self.gop_size
    }

    pub fn gop_data_at(&self, pos: usize) -> Option<&[Bytes]> {
        if pos >= self.gop_count() {
            return None;
        }
        Some(&self.gop_ring[(pos + self.gop_ring_first) % self.gop_size].data)
    }

    /// Reset slots and ring, keeping capacity.
    pub fn clear(&mut self) {
        self.metadata = None;
        self.video_seq_header = None;
        self.aac_seq_header = None;
        for gop in &mut self.gop_ring {
            gop.clear();
        }
        self.gop_ring_first = 0;
        self.gop_ring_last = 0;
    }

    // frames before the first key frame have no GOP to join and are dropped
    fn feed_last_gop(&mut self, lazy: &mut dyn FnMut() -> Bytes) {
        if !self.is_gop_ring_empty() {
            let idx = (self.gop_ring_last + self.gop_size - 1) % self.gop_size;
            self.gop_ring[idx].feed(lazy());
        }
    }

    fn feed_new_gop(&mut self, payload: Bytes) {
        if self.is_gop_ring_full() {
            self.gop_ring_first = (self.gop_ring_first + 1) % self.gop_size;
        }
        self.gop_ring[self.gop_ring_last].clear();
        self.gop_ring[self.gop_ring_last].feed(payload);
        self.gop_ring_last = (self.gop_ring_last + 1) % self.gop_size;
    }

    fn is_gop_ring_full(&self) -> bool {
        (self.gop_ring_last + 1) % self.gop_size == self.gop_ring_first
    }

    fn is_gop_ring_empty(&self) -> bool {
        self.gop_ring_first == self.gop_ring_last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::RtmpHeader;

    fn video_msg(key: bool, tag: u8) -> RtmpMsg {
        let payload = vec![if key { 0x17 } else { 0x27 }, 0x01, 0, 0, 0, tag];
        RtmpMsg {
            header: RtmpHeader {
                msg_type_id: RTMP_TYPE_ID_VIDEO,
                msg_len: payload.len() as u32,
                ..Default::default()
            },
            payload: Bytes::from(payload),
        }
    }

    fn metadata_msg() -> RtmpMsg {
        RtmpMsg {
            header: RtmpHeader {
                msg_type_id: RTMP_TYPE_ID_METADATA,
                msg_len: 2,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x02, 0x00]),
        }
    }

    fn feed(cache: &mut GopCache, msg: &RtmpMsg) {
        let payload = msg.payload.clone();
        cache.feed(msg, &mut move || payload.clone());
    }

    #[test]
    fn ring_keeps_at_most_gop_num_gops() {
        let mut cache = GopCache::new("rtmp", "G1", 2);
        assert_eq!(cache.gop_count(), 0);

        for round in 0..4u8 {
            feed(&mut cache, &video_msg(true, round));
            feed(&mut cache, &video_msg(false, round));
        }
        // four GOPs fed, two retained, oldest first
        assert_eq!(cache.gop_count(), 2);
        let oldest = cache.gop_data_at(0).unwrap();
        assert_eq!(oldest[0][5], 2);
        let newest = cache.gop_data_at(1).unwrap();
        assert_eq!(newest[0][5], 3);
        assert!(cache.gop_data_at(2).is_none());
    }

    #[test]
    fn frames_before_first_key_frame_are_dropped() {
        let mut cache = GopCache::new("rtmp", "G1", 2);
        feed(&mut cache, &video_msg(false, 0));
        assert_eq!(cache.gop_count(), 0);

        feed(&mut cache, &video_msg(true, 1));
        feed(&mut cache, &video_msg(false, 2));
        assert_eq!(cache.gop_count(), 1);
        assert_eq!(cache.gop_data_at(0).unwrap().len(), 2);
    }

    #[test]
    fn seq_headers_and_metadata_take_slots_not_gops() {
        let mut cache = GopCache::new("rtmp", "G1", 2);
        feed(&mut cache, &metadata_msg());

        let vsh = RtmpMsg {
            header: RtmpHeader {
                msg_type_id: RTMP_TYPE_ID_VIDEO,
                msg_len: 5,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x17, 0x00, 0, 0, 0]),
        };
        feed(&mut cache, &vsh);

        let ash = RtmpMsg {
            header: RtmpHeader {
                msg_type_id: RTMP_TYPE_ID_AUDIO,
                msg_len: 4,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xaf, 0x00, 0x12, 0x10]),
        };
        feed(&mut cache, &ash);

        assert!(cache.metadata.is_some());
        assert!(cache.video_seq_header.is_some());
        assert!(cache.aac_seq_header.is_some());
        assert_eq!(cache.gop_count(), 0);
    }

    #[test]
    fn clear_resets_everything() {
        let mut cache = GopCache::new("rtmp", "G1", 2);
        feed(&mut cache, &metadata_msg());
        feed(&mut cache, &video_msg(true, 0));
        cache.clear();
        assert!(cache.metadata.is_none());
        assert_eq!(cache.gop_count(), 0);
    }

    #[test]
    fn zero_gop_num_disables_the_ring() {
        let mut cache = GopCache::new("rtmp", "G1", 0);
        feed(&mut cache, &video_msg(true, 0));
        feed(&mut cache, &video_msg(false, 1));
        assert_eq!(cache.gop_count(), 0);
    }

    #[test]
    fn lazy_conversion_runs_at_most_once_per_feed() {
        let mut cache = GopCache::new("rtmp", "G1", 2);
        let msg = video_msg(true, 0);
        let mut calls = 0;
        cache.feed(&msg, &mut || {
            calls += 1;
            Bytes::from_static(&[0x17, 0x01, 0, 0, 0, 0])
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn lazy_chunks_memoizes() {
        let msg = video_msg(true, 0);
        let header = crate::remux::make_default_header(&msg.header);
        let mut lazy = LazyChunks::new(&msg, &header);
        let first = lazy.get();
        let second = lazy.get();
        assert_eq!(first, second);
        // Bytes clones share the same backing allocation
        assert_eq!(first.as_ptr(), second.as_ptr());
    }
}
