use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::base::{gen_unique_key, RtmpMsg, UKP_HLS_MUXER};
use crate::hls::fragment::Fragment;
use crate::hls::streamer::Streamer;
use crate::mpegts::{self, Frame, PID_AUDIO, PID_VIDEO, STREAM_ID_AUDIO};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    pub enable: bool,
    pub out_path: String,
    pub fragment_duration_ms: u32,
    pub fragment_num: usize,
    /// Append #EXT-X-ENDLIST when the input ends.
    pub end_list: bool,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            enable: false,
            out_path: "./hls/".to_string(),
            fragment_duration_ms: 4000,
            fragment_num: 6,
            end_list: false,
        }
    }
}

/// TS packets for one elementary frame, as handed to HTTP-TS subscribers.
/// `boundary` marks the first frame of a new segment; fresh subscribers
/// start consuming there.
#[derive(Debug, Clone)]
pub struct TsOutput {
    pub packets: Bytes,
    pub boundary: bool,
}

struct FragmentInfo {
    id: u64,
    duration_sec: f64,
    discont: bool,
    filename: String,
}

/// Segments the elementary frame stream into .ts files under
/// `<out_path>/<stream_name>/` and maintains the rolling playlist.
///
/// Continuity counters for both PIDs live here; the streamer emits frames
/// with `cc = 0` and the packetizer's final value is carried across frames.
pub struct HlsMuxer {
    unique_key: String,
    stream_name: String,
    config: MuxerConfig,
    out_dir: PathBuf,
    playlist_path: PathBuf,

    streamer: Streamer,

    opened: bool,
    fragment: Option<Fragment>,
    frag_ts: u64,
    last_ts: u64,
    next_frag_id: u64,
    fragments: VecDeque<FragmentInfo>,
    max_frag_duration_sec: f64,
    pending_discont: bool,
    wrote_pcr_in_fragment: bool,

    audio_cc: u8,
    video_cc: u8,

    ended: bool,
}

impl HlsMuxer {
    pub fn new(stream_name: &str, config: &MuxerConfig) -> Self {
        let out_dir = Path::new(&config.out_path).join(stream_name);
        let playlist_path = out_dir.join("playlist.m3u8");
        Self {
            unique_key: gen_unique_key(UKP_HLS_MUXER),
            stream_name: stream_name.to_string(),
            config: config.clone(),
            out_dir,
            playlist_path,
            streamer: Streamer::new(),
            opened: false,
            fragment: None,
            frag_ts: 0,
            last_ts: 0,
            next_frag_id: 0,
            fragments: VecDeque::new(),
            max_frag_duration_sec: 0.0,
            pending_discont: false,
            wrote_pcr_in_fragment: false,
            audio_cc: 0,
            video_cc: 0,
            ended: false,
        }
    }

    pub fn start(&mut self) {
        info!(unique_key = %self.unique_key, stream = %self.stream_name, "lifecycle start hls muxer");
        if let Err(e) = std::fs::create_dir_all(&self.out_dir) {
            error!(unique_key = %self.unique_key, err = %e, path = %self.out_dir.display(), "create hls out dir failed");
        }
    }

    pub fn out_path(&self) -> &Path {
        &self.out_dir
    }

    /// Remux one message. Emitted TS chunks are appended to `out` for the
    /// HTTP-TS fan-out.
    pub fn feed_rtmp_message(&mut self, msg: &RtmpMsg, out: &mut Vec<TsOutput>) {
        let mut frames = Vec::new();
        self.streamer.feed_rtmp_message(msg, &mut frames);
        for mut frame in frames {
            self.on_frame(&mut frame, out);
        }
    }

    /// Flush pending audio, close the open fragment, finalize the playlist.
    pub fn dispose(&mut self) {
        info!(unique_key = %self.unique_key, stream = %self.stream_name, "lifecycle dispose hls muxer");
        self.ended = true;
        let mut flushed = Vec::new();
        self.streamer.flush_audio(&mut flushed);
        for mut frame in flushed {
            self.write_frame(&mut frame);
        }
        self.close_fragment();
    }

    fn on_frame(&mut self, frame: &mut Frame, out: &mut Vec<TsOutput>) {
        let is_audio = frame.sid == STREAM_ID_AUDIO;
        // with a video track present, only video key frames may open a
        // segment; audio-only streams rotate on batch arrival
        let candidate = if is_audio {
            !self.streamer.video_seq_header_cached()
        } else {
            frame.key
        };
        let rotate = self.should_rotate(frame.dts, candidate);

        if rotate {
            // batched audio belongs to the closing segment
            if !is_audio && !self.streamer.audio_cache_empty() {
                let mut flushed = Vec::new();
                self.streamer.flush_audio(&mut flushed);
                for mut af in flushed {
                    if let Some(packed) = self.write_frame(&mut af) {
                        out.push(TsOutput {
                            packets: packed,
                            boundary: false,
                        });
                    }
                }
            }
            self.close_fragment();
            self.open_fragment(frame.dts);
        }

        if !self.opened {
            return;
        }

        if let Some(packed) = self.write_frame(frame) {
            out.push(TsOutput {
                packets: packed,
                boundary: rotate,
            });
        }

        self.last_ts = frame.dts;
        if let Some(info) = self.fragments.back_mut() {
            info.duration_sec = frame.dts.saturating_sub(self.frag_ts) as f64 / 90_000.0;
        }
    }

    fn should_rotate(&mut self, ts: u64, boundary_candidate: bool) -> bool {
        if !self.opened {
            return boundary_candidate;
        }
        // a large jump in either direction forces a discontinuity switch
        let max_jump = u64::from(self.config.fragment_duration_ms) * 90 * 10;
        if ts.saturating_sub(self.frag_ts) > max_jump || self.frag_ts.saturating_sub(ts) > max_jump
        {
            warn!(
                unique_key = %self.unique_key,
                frag_ts = self.frag_ts,
                ts,
                "timestamp jump, force new fragment"
            );
            self.pending_discont = true;
            return true;
        }
        let duration_ms = ts.saturating_sub(self.frag_ts) / 90;
        boundary_candidate && duration_ms >= u64::from(self.config.fragment_duration_ms)
    }

    fn open_fragment(&mut self, ts: u64) {
        let filename = format!(
            "{}-{}.ts",
            self.stream_name,
            chrono::Utc::now().timestamp_millis()
        );
        let path = self.out_dir.join(&filename);
        match Fragment::open(&path) {
            Ok(fragment) => {
                self.fragment = Some(fragment);
                self.opened = true;
                self.frag_ts = ts;
                self.last_ts = ts;
                self.wrote_pcr_in_fragment = false;
                self.fragments.push_back(FragmentInfo {
                    id: self.next_frag_id,
                    duration_sec: 0.0,
                    discont: std::mem::take(&mut self.pending_discont),
                    filename,
                });
                self.next_frag_id += 1;
                while self.fragments.len() > self.config.fragment_num {
                    self.fragments.pop_front();
                }
            }
            Err(e) => {
                // media keeps flowing; the next boundary retries
                error!(unique_key = %self.unique_key, err = %e, path = %path.display(), "open fragment failed");
                self.fragment = None;
                self.opened = false;
            }
        }
    }

    fn close_fragment(&mut self) {
        if let Some(fragment) = self.fragment.take() {
            if let Some(info) = self.fragments.back_mut() {
                info.duration_sec = self.last_ts.saturating_sub(self.frag_ts) as f64 / 90_000.0;
                if info.duration_sec > self.max_frag_duration_sec {
                    self.max_frag_duration_sec = info.duration_sec;
                }
            }
            if let Err(e) = fragment.close() {
                error!(unique_key = %self.unique_key, err = %e, "close fragment failed");
            }
            self.write_playlist();
        }
        self.opened = false;
    }

    fn write_frame(&mut self, frame: &mut Frame) -> Option<Bytes> {
        if !self.opened {
            return None;
        }
        // PCR rides the video track when present, else the audio track
        let pcr_pid = if self.streamer.video_seq_header_cached() {
            PID_VIDEO
        } else {
            PID_AUDIO
        };
        let with_pcr = !self.wrote_pcr_in_fragment && frame.pid == pcr_pid;

        frame.cc = if frame.pid == PID_VIDEO {
            self.video_cc
        } else {
            self.audio_cc
        };
        let packed = mpegts::pack_frame(frame, with_pcr);
        if frame.pid == PID_VIDEO {
            self.video_cc = frame.cc;
        } else {
            self.audio_cc = frame.cc;
        }
        if with_pcr {
            self.wrote_pcr_in_fragment = true;
        }

        if let Some(fragment) = &mut self.fragment {
            if let Err(e) = fragment.write_packets(&packed) {
                error!(unique_key = %self.unique_key, err = %e, "write fragment failed");
            }
        }
        Some(packed.freeze())
    }

    fn write_playlist(&self) {
        let mut content = String::with_capacity(512);
        content.push_str("#EXTM3U\n");
        content.push_str("#EXT-X-VERSION:3\n");
        let seq = self.fragments.front().map_or(0, |f| f.id);
        content.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{seq}\n"));
        content.push_str(&format!(
            "#EXT-X-TARGETDURATION:{}\n",
            self.max_frag_duration_sec.ceil() as u64
        ));
        content.push_str("#EXT-X-ALLOW-CACHE:NO\n");
        for frag in &self.fragments {
            if frag.discont {
                content.push_str("#EXT-X-DISCONTINUITY\n");
            }
            content.push_str(&format!("#EXTINF:{:.3},\n", frag.duration_sec));
            content.push_str(&frag.filename);
            content.push('\n');
        }
        if self.ended && self.config.end_list {
            content.push_str("#EXT-X-ENDLIST\n");
        }

        let tmp = self.playlist_path.with_extension("m3u8.tmp");
        let result = std::fs::write(&tmp, &content)
            .and_then(|()| std::fs::rename(&tmp, &self.playlist_path));
        if let Err(e) = result {
            error!(unique_key = %self.unique_key, err = %e, "write playlist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{RtmpHeader, RTMP_TYPE_ID_AUDIO, RTMP_TYPE_ID_VIDEO};
    use bytes::Bytes;

    const SPS_720P: [u8; 24] = [
        0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10, 0x00, 0x00,
        0x3E, 0x90, 0x00, 0x0E, 0xA6, 0x00, 0xF1, 0x83, 0x19, 0x60,
    ];
    const PPS: [u8; 4] = [0x68, 0xEB, 0xE3, 0xCB];

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

    fn video_msg(ts: u32, key: bool) -> RtmpMsg {
        let nalu: &[u8] = if key {
            &[0x65, 0x88, 0x80, 0x10]
        } else {
            &[0x41, 0x9a, 0x00]
        };
        let mut p = vec![if key { 0x17 } else { 0x27 }, 0x01, 0x00, 0x00, 0x00];
        p.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        p.extend_from_slice(nalu);
        msg(RTMP_TYPE_ID_VIDEO, ts, p)
    }

    fn test_config(dir: &Path) -> MuxerConfig {
        MuxerConfig {
            enable: true,
            out_path: dir.to_string_lossy().into_owned(),
            fragment_duration_ms: 1000,
            fragment_num: 3,
            end_list: true,
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rill-muxer-{tag}"));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// 30 fps stream with a key frame every second, three seconds long.
    fn feed_three_gops(muxer: &mut HlsMuxer) -> Vec<TsOutput> {
        let mut out = Vec::new();
        muxer.feed_rtmp_message(&video_seq_header_msg(), &mut out);
        for i in 0..90u32 {
            let ts = i * 34;
            muxer.feed_rtmp_message(&video_msg(ts, i % 30 == 0), &mut out);
        }
        out
    }

    #[test]
    fn segments_on_key_frames_and_duration() {
        let dir = temp_dir("segments");
        let mut muxer = HlsMuxer::new("teststream", &test_config(&dir));
        muxer.start();

        let out = feed_three_gops(&mut muxer);
        muxer.dispose();

        // first frame opens a segment, later key frames rotate once the
        // 1000ms target is reached
        let boundaries: Vec<_> = out.iter().filter(|o| o.boundary).collect();
        assert_eq!(boundaries.len(), 3);

        let ts_files: Vec<_> = std::fs::read_dir(dir.join("teststream"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "ts"))
            .collect();
        assert_eq!(ts_files.len(), 3);

        for entry in &ts_files {
            let content = std::fs::read(entry.path()).unwrap();
            assert_eq!(content.len() % mpegts::TS_PACKET_SIZE, 0);
            assert_eq!(&content[..2 * 188], mpegts::fixed_fragment_header());
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn playlist_has_exact_tag_set() {
        let dir = temp_dir("playlist");
        let mut muxer = HlsMuxer::new("teststream", &test_config(&dir));
        muxer.start();
        feed_three_gops(&mut muxer);
        muxer.dispose();

        let playlist =
            std::fs::read_to_string(dir.join("teststream").join("playlist.m3u8")).unwrap();
        let lines: Vec<&str> = playlist.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        assert!(lines[2].starts_with("#EXT-X-MEDIA-SEQUENCE:"));
        assert!(lines[3].starts_with("#EXT-X-TARGETDURATION:"));
        assert_eq!(lines[4], "#EXT-X-ALLOW-CACHE:NO");
        assert!(lines.iter().any(|l| l.starts_with("#EXTINF:")));
        assert_eq!(*lines.last().unwrap(), "#EXT-X-ENDLIST");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn continuity_counters_have_no_gaps() {
        let dir = temp_dir("cc");
        let mut muxer = HlsMuxer::new("teststream", &test_config(&dir));
        muxer.start();
        let out = feed_three_gops(&mut muxer);
        muxer.dispose();

        let mut prev_cc: Option<u8> = None;
        for ts_output in &out {
            for pkt in ts_output.packets.chunks(mpegts::TS_PACKET_SIZE) {
                let h = mpegts::parse_ts_packet_header(pkt);
                assert_eq!(h.pid, mpegts::PID_VIDEO);
                if let Some(prev) = prev_cc {
                    assert_eq!(h.cc, (prev + 1) & 0x0F, "continuity gap");
                }
                prev_cc = Some(h.cc);
            }
        }
    }

    #[test]
    fn closed_segments_respect_duration_bound() {
        let dir = temp_dir("duration");
        let config = test_config(&dir);
        let mut muxer = HlsMuxer::new("teststream", &config);
        muxer.start();
        feed_three_gops(&mut muxer);
        muxer.dispose();

        let bound = f64::from(config.fragment_duration_ms) * 2.0 / 1000.0;
        for frag in &muxer.fragments {
            assert!(
                frag.duration_sec <= bound,
                "segment {} runs {}s, bound {}s",
                frag.id,
                frag.duration_sec,
                bound
            );
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rolling_window_evicts_oldest_entry() {
        let dir = temp_dir("window");
        let mut muxer = HlsMuxer::new("teststream", &test_config(&dir));
        muxer.start();

        let mut out = Vec::new();
        muxer.feed_rtmp_message(&video_seq_header_msg(), &mut out);
        // five 1s GOPs against a window of three
        for i in 0..150u32 {
            muxer.feed_rtmp_message(&video_msg(i * 34, i % 30 == 0), &mut out);
        }
        muxer.dispose();

        assert_eq!(muxer.fragments.len(), 3);
        // media sequence advanced past the evicted fragments
        assert_eq!(muxer.fragments.front().unwrap().id, 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn audio_only_stream_segments_on_batches() {
        let dir = temp_dir("audio-only");
        let mut muxer = HlsMuxer::new("radio", &test_config(&dir));
        muxer.start();

        let mut out = Vec::new();
        muxer.feed_rtmp_message(&msg(RTMP_TYPE_ID_AUDIO, 0, vec![0xaf, 0x00, 0x12, 0x10]), &mut out);
        for i in 0..130u32 {
            let payload = vec![0xaf, 0x01, 0x21, 0x2b, 0x94, 0xa5];
            muxer.feed_rtmp_message(&msg(RTMP_TYPE_ID_AUDIO, i * 23, payload), &mut out);
        }
        muxer.dispose();

        assert!(!out.is_empty());
        assert!(out.iter().any(|o| o.boundary));
        for ts_output in &out {
            let h = mpegts::parse_ts_packet_header(&ts_output.packets);
            assert_eq!(h.pid, mpegts::PID_AUDIO);
        }
        // roughly 3 seconds of audio over a 1s target
        assert!(muxer.fragments.len() >= 2);

        std::fs::remove_dir_all(&dir).ok();
    }
}
