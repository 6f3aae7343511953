// Per-stream broadcast group: one input, many outputs, GOP caching, HLS,
// relay fan-out. Every observer callback, API mutator, and the ticker
// serialize through the group's mutex; subscriber writes inside the lock
// are non-blocking enqueues onto each session's own write queue.

pub mod avpacket_queue;
pub mod gop_cache;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::base::{
    gen_unique_key, AvPacket, RtmpMsg, RtpPacket, StatGroup, UKP_FLV_SUB, UKP_GROUP,
    UKP_RTMP_PUB, UKP_RTMP_SUB, UKP_RTSP_PUB, UKP_RTSP_SUB, UKP_TS_SUB, AUDIO_CODEC_AAC,
    VIDEO_CODEC_AVC, VIDEO_CODEC_HEVC,
};
use crate::codec::{avc, hevc};
use crate::config::Config;
use crate::group::avpacket_queue::AvPacketQueue;
use crate::group::gop_cache::{GopCache, LazyChunks, LazyFlvTag};
use crate::hls::{HlsMuxer, TsOutput};
use crate::relay::{OnRtmpMsg, RelayClient, RelayOptions};
use crate::remux::{self, make_default_header};
use crate::session::{
    HttpflvSubSession, HttptsSubSession, PullSession, PushSession, RtmpPubSession,
    RtmpSubSession, RtspPubSession, RtspSubSession, FLV_HTTP_RESPONSE_HEADER,
    TS_HTTP_RESPONSE_HEADER,
};

/// Liveness sweep cadence, in ticker ticks.
const CHECK_SESSION_ALIVE_INTERVAL_TICKS: u32 = 10;
/// Bitrate recalculation cadence, in ticker ticks.
const CALC_SESSION_STAT_INTERVAL_TICKS: u32 = 5;

/// Bound on subscriber count for full debug stat dumps.
const DEBUG_STATS_MAX_SUBS: usize = 10;

pub type MuxerAliveProbe = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct PullProxy {
    is_pulling: bool,
    session: Option<Arc<PullSession>>,
}

#[derive(Default)]
struct PushProxy {
    is_pushing: bool,
    session: Option<Arc<PushSession>>,
}

struct GroupInner {
    stat: StatGroup,

    rtmp_pub: Option<Arc<RtmpPubSession>>,
    rtsp_pub: Option<Arc<RtspPubSession>>,
    pull_enable: bool,
    pull_url: String,
    pull_proxy: PullProxy,

    rtmp_subs: HashMap<String, Arc<RtmpSubSession>>,
    httpflv_subs: HashMap<String, Arc<HttpflvSubSession>>,
    httpts_subs: HashMap<String, Arc<HttptsSubSession>>,
    rtsp_subs: HashMap<String, Arc<RtspSubSession>>,

    push_proxies: HashMap<String, PushProxy>,

    hls_muxer: Option<HlsMuxer>,

    gop_cache: GopCache,
    httpflv_gop_cache: GopCache,

    avpacket_queue: AvPacketQueue,
    asc: Option<Bytes>,
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,

    tick_count: u32,
}

pub struct Group {
    pub unique_key: String,
    app_name: String,
    stream_name: String,
    config: Arc<Config>,
    relay_client: Arc<dyn RelayClient>,
    weak_self: Weak<Group>,
    exit: Notify,
    muxer_alive_probe: Mutex<Option<MuxerAliveProbe>>,
    inner: Mutex<GroupInner>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("unique_key", &self.unique_key)
            .field("app_name", &self.app_name)
            .field("stream_name", &self.stream_name)
            .finish()
    }
}

impl Group {
    pub fn new(
        app_name: &str,
        stream_name: &str,
        pull_enable: bool,
        pull_url: &str,
        config: Arc<Config>,
        relay_client: Arc<dyn RelayClient>,
    ) -> Arc<Self> {
        let unique_key = gen_unique_key(UKP_GROUP);
        info!(unique_key = %unique_key, app_name, stream_name, "lifecycle new group");

        let mut push_proxies = HashMap::new();
        if config.relay_push.enable {
            for addr in &config.relay_push.addr_list {
                let url = format!("rtmp://{addr}/{app_name}/{stream_name}");
                push_proxies.insert(url, PushProxy::default());
            }
        }

        Arc::new_cyclic(|weak_self| Self {
            app_name: app_name.to_string(),
            stream_name: stream_name.to_string(),
            relay_client,
            weak_self: weak_self.clone(),
            exit: Notify::new(),
            muxer_alive_probe: Mutex::new(None),
            inner: Mutex::new(GroupInner {
                stat: StatGroup {
                    app_name: app_name.to_string(),
                    stream_name: stream_name.to_string(),
                    ..Default::default()
                },
                rtmp_pub: None,
                rtsp_pub: None,
                pull_enable,
                pull_url: pull_url.to_string(),
                pull_proxy: PullProxy::default(),
                rtmp_subs: HashMap::new(),
                httpflv_subs: HashMap::new(),
                httpts_subs: HashMap::new(),
                rtsp_subs: HashMap::new(),
                push_proxies,
                hls_muxer: None,
                gop_cache: GopCache::new("rtmp", &unique_key, config.rtmp.gop_num),
                httpflv_gop_cache: GopCache::new("httpflv", &unique_key, config.httpflv.gop_num),
                avpacket_queue: AvPacketQueue::new(),
                asc: None,
                vps: None,
                sps: None,
                pps: None,
                tick_count: 0,
            }),
            config,
            unique_key,
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Set by the manager so the deferred HLS cleanup can observe whether a
    /// new muxer for the same stream has come alive.
    pub fn set_muxer_alive_probe(&self, probe: MuxerAliveProbe) {
        *self.muxer_alive_probe.lock() = Some(probe);
    }

    // ---------------------------------------------------------- inputs

    pub fn add_rtmp_pub_session(&self, session: Arc<RtmpPubSession>) -> bool {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "add rtmp pub session");
        let mut inner = self.inner.lock();
        if Self::has_in_session_inner(&inner) {
            error!(unique_key = %self.unique_key, wanna_add = %session.unique_key(), "input session already exists");
            return false;
        }
        inner.rtmp_pub = Some(session);
        self.add_in(&mut inner);
        true
    }

    pub fn del_rtmp_pub_session(&self, session: &Arc<RtmpPubSession>) {
        let mut inner = self.inner.lock();
        let matches = inner
            .rtmp_pub
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, session));
        if !matches {
            warn!(unique_key = %self.unique_key, session = %session.unique_key(), "del rtmp pub session but not match");
            return;
        }
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "del rtmp pub session");
        inner.rtmp_pub = None;
        self.del_in(&mut inner);
    }

    pub fn add_rtsp_pub_session(&self, session: Arc<RtspPubSession>) -> bool {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "add rtsp pub session");
        let mut inner = self.inner.lock();
        if Self::has_in_session_inner(&inner) {
            error!(unique_key = %self.unique_key, wanna_add = %session.unique_key(), "input session already exists");
            return false;
        }
        inner.rtsp_pub = Some(session);
        self.add_in(&mut inner);
        true
    }

    pub fn del_rtsp_pub_session(&self, session: &Arc<RtspPubSession>) {
        let mut inner = self.inner.lock();
        let matches = inner
            .rtsp_pub
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, session));
        if !matches {
            warn!(unique_key = %self.unique_key, session = %session.unique_key(), "del rtsp pub session but not match");
            return;
        }
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "del rtsp pub session");
        if let Some(s) = inner.rtsp_pub.take() {
            s.dispose();
        }
        self.del_in(&mut inner);
    }

    pub fn add_rtmp_pull_session(&self, session: Arc<PullSession>) -> bool {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "add rtmp pull session");
        let mut inner = self.inner.lock();
        if Self::has_in_session_inner(&inner) {
            error!(unique_key = %self.unique_key, wanna_add = %session.unique_key(), "input session already exists");
            return false;
        }
        inner.pull_proxy.session = Some(session);
        self.add_in(&mut inner);
        true
    }

    pub fn del_rtmp_pull_session(&self, session: &Arc<PullSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "del rtmp pull session");
        let mut inner = self.inner.lock();
        inner.pull_proxy.session = None;
        inner.pull_proxy.is_pulling = false;
        self.del_in(&mut inner);
    }

    fn clear_pull_attempt(&self) {
        let mut inner = self.inner.lock();
        inner.pull_proxy.is_pulling = false;
    }

    // ------------------------------------------------------- subscribers

    pub fn add_rtmp_sub_session(&self, session: Arc<RtmpSubSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "add rtmp sub session");
        let mut inner = self.inner.lock();
        inner
            .rtmp_subs
            .insert(session.unique_key().to_string(), session);
        self.pull_if_needed(&mut inner);
    }

    pub fn del_rtmp_sub_session(&self, session: &Arc<RtmpSubSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "del rtmp sub session");
        let mut inner = self.inner.lock();
        inner.rtmp_subs.remove(session.unique_key());
    }

    pub fn add_httpflv_sub_session(&self, session: Arc<HttpflvSubSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "add httpflv sub session");
        session.write_raw_packet(Bytes::from_static(FLV_HTTP_RESPONSE_HEADER));
        session.write_raw_packet(Bytes::from_static(&remux::FLV_FILE_HEADER));

        let mut inner = self.inner.lock();
        inner
            .httpflv_subs
            .insert(session.unique_key().to_string(), session);
        self.pull_if_needed(&mut inner);
    }

    pub fn del_httpflv_sub_session(&self, session: &Arc<HttpflvSubSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "del httpflv sub session");
        let mut inner = self.inner.lock();
        inner.httpflv_subs.remove(session.unique_key());
    }

    pub fn add_httpts_sub_session(&self, session: Arc<HttptsSubSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "add httpts sub session");
        session.write_raw_packet(Bytes::from_static(TS_HTTP_RESPONSE_HEADER));
        session.write_raw_packet(Bytes::from_static(crate::mpegts::fixed_fragment_header()));

        let mut inner = self.inner.lock();
        inner
            .httpts_subs
            .insert(session.unique_key().to_string(), session);
        self.pull_if_needed(&mut inner);
    }

    pub fn del_httpts_sub_session(&self, session: &Arc<HttptsSubSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "del httpts sub session");
        let mut inner = self.inner.lock();
        inner.httpts_subs.remove(session.unique_key());
    }

    /// SDP for an RTSP subscriber's DESCRIBE; `None` when no RTSP publisher
    /// is active, in which case the caller rejects the subscriber.
    pub fn sdp_for_describe(&self) -> Option<Bytes> {
        let inner = self.inner.lock();
        match &inner.rtsp_pub {
            Some(pub_session) => Some(pub_session.sdp_context().raw_sdp),
            None => {
                warn!(unique_key = %self.unique_key, "rtsp describe but no rtsp pub session");
                None
            }
        }
    }

    pub fn add_rtsp_sub_session(&self, session: Arc<RtspSubSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "add rtsp sub session");
        let mut inner = self.inner.lock();
        inner
            .rtsp_subs
            .insert(session.unique_key().to_string(), session);
    }

    pub fn del_rtsp_sub_session(&self, session: &Arc<RtspSubSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), "del rtsp sub session");
        let mut inner = self.inner.lock();
        inner.rtsp_subs.remove(session.unique_key());
    }

    // -------------------------------------------------------- observers

    /// RTMP publisher or relay pull delivering one demuxed message.
    pub fn on_read_rtmp_msg(&self, msg: RtmpMsg) {
        let mut inner = self.inner.lock();
        self.broadcast_rtmp(&mut inner, &msg);
    }

    /// RTSP publisher tunneling a raw RTP packet to RTSP subscribers.
    pub fn on_rtp_packet(&self, pkt: RtpPacket) {
        let inner = self.inner.lock();
        for session in inner.rtsp_subs.values() {
            session.write_rtp_packet(&pkt);
        }
    }

    /// RTSP publisher's decoder configs, parsed from SDP. Synthesizes and
    /// broadcasts RTMP metadata and seq header messages.
    pub fn on_av_config(
        &self,
        asc: Option<Bytes>,
        vps: Option<Bytes>,
        sps: Option<Bytes>,
        pps: Option<Bytes>,
    ) {
        let mut inner = self.inner.lock();
        inner.asc = asc;
        inner.vps = vps;
        inner.sps = sps;
        inner.pps = pps;

        let result = remux::av_config_to_rtmp_msgs(
            inner.asc.as_deref(),
            inner.vps.as_deref(),
            inner.sps.as_deref(),
            inner.pps.as_deref(),
        );
        let (metadata, video_seq_header, aac_seq_header) = match result {
            Ok(msgs) => msgs,
            Err(e) => {
                error!(unique_key = %self.unique_key, err = %e, "remux av config to rtmp msgs failed");
                return;
            }
        };
        if let Some(msg) = metadata {
            self.broadcast_rtmp(&mut inner, &msg);
        }
        if let Some(msg) = video_seq_header {
            self.broadcast_rtmp(&mut inner, &msg);
        }
        if let Some(msg) = aac_seq_header {
            self.broadcast_rtmp(&mut inner, &msg);
        }
    }

    /// RTSP publisher's depacketized access unit. Interleaved with its peer
    /// track, converted, and broadcast.
    pub fn on_av_packet(&self, pkt: AvPacket) {
        let mut inner = self.inner.lock();
        let mut interleaved = Vec::new();
        inner
            .avpacket_queue
            .feed(pkt, &mut |out| interleaved.push(out));
        for pkt in interleaved {
            match remux::av_packet_to_rtmp_msg(&pkt) {
                Ok(msg) => self.broadcast_rtmp(&mut inner, &msg),
                Err(e) => {
                    error!(unique_key = %self.unique_key, err = %e, "remux av packet to rtmp msg failed");
                }
            }
        }
    }

    // ------------------------------------------------------- hot path

    fn broadcast_rtmp(&self, inner: &mut GroupInner, msg: &RtmpMsg) {
        // 0. hls
        let mut ts_outputs: Vec<TsOutput> = Vec::new();
        if self.config.hls.muxer.enable {
            if let Some(muxer) = inner.hls_muxer.as_mut() {
                muxer.feed_rtmp_message(msg, &mut ts_outputs);
            }
        }
        for ts_output in &ts_outputs {
            for session in inner.httpts_subs.values() {
                if session.is_fresh.load(Ordering::Relaxed) {
                    // never join mid-segment
                    if ts_output.boundary {
                        session.is_fresh.store(false, Ordering::Relaxed);
                        session.write_raw_packet(ts_output.packets.clone());
                    }
                } else {
                    session.write_raw_packet(ts_output.packets.clone());
                }
            }
        }

        // 1. canonical header for re-emission
        let curr_header = make_default_header(&msg.header);
        if curr_header.msg_len != msg.payload.len() as u32 {
            error!(
                unique_key = %self.unique_key,
                msg_len = curr_header.msg_len,
                payload_len = msg.payload.len(),
                "msg len and payload len differ"
            );
        }

        // 2. chunking and flv tagging are paid only if some consumer needs them
        let mut lazy_chunks = LazyChunks::new(msg, &curr_header);
        let mut lazy_flv_tag = LazyFlvTag::new(msg);

        // 3. rtmp subs; fresh ones get the cached preamble and gop backlog first
        for session in inner.rtmp_subs.values() {
            if session.is_fresh.load(Ordering::Relaxed) {
                if let Some(metadata) = &inner.gop_cache.metadata {
                    session.async_write(metadata.clone());
                }
                if let Some(video_seq_header) = &inner.gop_cache.video_seq_header {
                    session.async_write(video_seq_header.clone());
                }
                if let Some(aac_seq_header) = &inner.gop_cache.aac_seq_header {
                    session.async_write(aac_seq_header.clone());
                }
                for i in 0..inner.gop_cache.gop_count() {
                    if let Some(gop) = inner.gop_cache.gop_data_at(i) {
                        for item in gop {
                            session.async_write(item.clone());
                        }
                    }
                }
                session.is_fresh.store(false, Ordering::Relaxed);
            }
            session.async_write(lazy_chunks.get());
        }

        // 4. relay push proxies follow the rtmp sub contract
        if self.config.relay_push.enable {
            for proxy in inner.push_proxies.values() {
                let Some(session) = &proxy.session else {
                    continue;
                };
                if session.is_fresh.load(Ordering::Relaxed) {
                    if let Some(metadata) = &inner.gop_cache.metadata {
                        session.async_write(metadata.clone());
                    }
                    if let Some(video_seq_header) = &inner.gop_cache.video_seq_header {
                        session.async_write(video_seq_header.clone());
                    }
                    if let Some(aac_seq_header) = &inner.gop_cache.aac_seq_header {
                        session.async_write(aac_seq_header.clone());
                    }
                    for i in 0..inner.gop_cache.gop_count() {
                        if let Some(gop) = inner.gop_cache.gop_data_at(i) {
                            for item in gop {
                                session.async_write(item.clone());
                            }
                        }
                    }
                    session.is_fresh.store(false, Ordering::Relaxed);
                }
                session.async_write(lazy_chunks.get());
            }
        }

        // 5. httpflv subs, from the flv-tagged cache
        for session in inner.httpflv_subs.values() {
            if session.is_fresh.load(Ordering::Relaxed) {
                if let Some(metadata) = &inner.httpflv_gop_cache.metadata {
                    session.write_raw_packet(metadata.clone());
                }
                if let Some(video_seq_header) = &inner.httpflv_gop_cache.video_seq_header {
                    session.write_raw_packet(video_seq_header.clone());
                }
                if let Some(aac_seq_header) = &inner.httpflv_gop_cache.aac_seq_header {
                    session.write_raw_packet(aac_seq_header.clone());
                }
                for i in 0..inner.httpflv_gop_cache.gop_count() {
                    if let Some(gop) = inner.httpflv_gop_cache.gop_data_at(i) {
                        for item in gop {
                            session.write_raw_packet(item.clone());
                        }
                    }
                }
                session.is_fresh.store(false, Ordering::Relaxed);
            }
            session.write_raw_packet(lazy_flv_tag.get());
        }

        // 6. feed the caches
        if self.config.rtmp.enable {
            inner.gop_cache.feed(msg, &mut || lazy_chunks.get());
        }
        if self.config.httpflv.enable {
            inner
                .httpflv_gop_cache
                .feed(msg, &mut || lazy_flv_tag.get());
        }

        // 7. codec stat, set once per seq header kind
        if inner.stat.audio_codec.is_empty() && msg.is_aac_seq_header() {
            inner.stat.audio_codec = AUDIO_CODEC_AAC.to_string();
        }
        if inner.stat.video_codec.is_empty() {
            if msg.is_avc_key_seq_header() {
                inner.stat.video_codec = VIDEO_CODEC_AVC.to_string();
            }
            if msg.is_hevc_key_seq_header() {
                inner.stat.video_codec = VIDEO_CODEC_HEVC.to_string();
            }
        }
        if inner.stat.video_width == 0 || inner.stat.video_height == 0 {
            if msg.is_avc_key_seq_header() {
                if let Ok((sps, _)) = avc::parse_sps_pps_from_seq_header(&msg.payload) {
                    if let Ok(ctx) = avc::parse_sps(sps) {
                        inner.stat.video_width = ctx.width;
                        inner.stat.video_height = ctx.height;
                    }
                }
            }
            if msg.is_hevc_key_seq_header() {
                if let Ok((_, sps, _)) = hevc::parse_vps_sps_pps_from_seq_header(&msg.payload) {
                    if let Ok(ctx) = hevc::parse_sps(sps) {
                        inner.stat.video_width = ctx.pic_width_in_luma_samples;
                        inner.stat.video_height = ctx.pic_height_in_luma_samples;
                    }
                }
            }
        }
    }

    // ----------------------------------------------------------- ticker

    /// Driven roughly once per second by the manager.
    pub fn tick(&self) {
        let mut inner = self.inner.lock();

        self.stop_pull_if_needed(&mut inner);
        self.pull_if_needed(&mut inner);
        self.push_if_needed(&mut inner);

        if inner.tick_count % CHECK_SESSION_ALIVE_INTERVAL_TICKS == 0 {
            self.sweep_dead_sessions(&mut inner);
        }

        if inner.tick_count % CALC_SESSION_STAT_INTERVAL_TICKS == 0 {
            if let Some(s) = &inner.rtmp_pub {
                s.update_stat(CALC_SESSION_STAT_INTERVAL_TICKS);
            }
            if let Some(s) = &inner.rtsp_pub {
                s.update_stat(CALC_SESSION_STAT_INTERVAL_TICKS);
            }
            if let Some(s) = &inner.pull_proxy.session {
                s.update_stat(CALC_SESSION_STAT_INTERVAL_TICKS);
            }
            for s in inner.rtmp_subs.values() {
                s.update_stat(CALC_SESSION_STAT_INTERVAL_TICKS);
            }
            for s in inner.httpflv_subs.values() {
                s.update_stat(CALC_SESSION_STAT_INTERVAL_TICKS);
            }
            for s in inner.httpts_subs.values() {
                s.update_stat(CALC_SESSION_STAT_INTERVAL_TICKS);
            }
            for s in inner.rtsp_subs.values() {
                s.update_stat(CALC_SESSION_STAT_INTERVAL_TICKS);
            }
        }

        inner.tick_count += 1;
    }

    fn sweep_dead_sessions(&self, inner: &mut GroupInner) {
        let unique_key = &self.unique_key;

        let rtmp_pub_dead = inner
            .rtmp_pub
            .as_ref()
            .is_some_and(|s| !s.is_alive().0);
        if rtmp_pub_dead {
            if let Some(s) = inner.rtmp_pub.take() {
                warn!(unique_key = %unique_key, session = %s.unique_key(), "session timeout");
                s.dispose();
            }
            self.del_in(inner);
        }

        let rtsp_pub_dead = inner
            .rtsp_pub
            .as_ref()
            .is_some_and(|s| !s.is_alive().0);
        if rtsp_pub_dead {
            if let Some(s) = inner.rtsp_pub.take() {
                warn!(unique_key = %unique_key, session = %s.unique_key(), "session timeout");
                s.dispose();
            }
            self.del_in(inner);
        }

        let pull_dead = inner
            .pull_proxy
            .session
            .as_ref()
            .is_some_and(|s| !s.is_alive().0);
        if pull_dead {
            if let Some(s) = inner.pull_proxy.session.take() {
                warn!(unique_key = %unique_key, session = %s.unique_key(), "session timeout");
                s.dispose();
            }
            inner.pull_proxy.is_pulling = false;
            self.del_in(inner);
        }

        inner.rtmp_subs.retain(|_, s| {
            let (_, write_alive) = s.is_alive();
            if !write_alive {
                warn!(unique_key = %unique_key, session = %s.unique_key(), "session timeout");
                s.dispose();
            }
            write_alive
        });
        inner.httpflv_subs.retain(|_, s| {
            let (_, write_alive) = s.is_alive();
            if !write_alive {
                warn!(unique_key = %unique_key, session = %s.unique_key(), "session timeout");
                s.dispose();
            }
            write_alive
        });
        inner.httpts_subs.retain(|_, s| {
            let (_, write_alive) = s.is_alive();
            if !write_alive {
                warn!(unique_key = %unique_key, session = %s.unique_key(), "session timeout");
                s.dispose();
            }
            write_alive
        });
        inner.rtsp_subs.retain(|_, s| {
            let (_, write_alive) = s.is_alive();
            if !write_alive {
                warn!(unique_key = %unique_key, session = %s.unique_key(), "session timeout");
                s.dispose();
            }
            write_alive
        });
    }

    // ------------------------------------------------------ relay policy

    fn stop_pull_if_needed(&self, inner: &mut GroupInner) {
        if inner.pull_proxy.session.is_some() && !Self::has_out_session_inner(inner) {
            info!(unique_key = %self.unique_key, "stop pull since no sub session");
            if let Some(s) = &inner.pull_proxy.session {
                s.dispose();
            }
        }
    }

    fn pull_if_needed(&self, inner: &mut GroupInner) {
        if !inner.pull_enable
            || !Self::has_out_session_inner(inner)
            || Self::has_in_session_inner(inner)
            || inner.pull_proxy.is_pulling
        {
            return;
        }
        let Some(group) = self.weak_self.upgrade() else {
            return;
        };
        inner.pull_proxy.is_pulling = true;

        let url = inner.pull_url.clone();
        info!(unique_key = %self.unique_key, url = %url, "start relay pull");

        let client = Arc::clone(&self.relay_client);
        tokio::spawn(async move {
            let opts = RelayOptions::default();
            let sink: OnRtmpMsg = {
                let group = Arc::clone(&group);
                Arc::new(move |msg| group.on_read_rtmp_msg(msg))
            };
            match client.pull(&url, &opts, sink).await {
                Err(e) => {
                    error!(unique_key = %group.unique_key, url = %url, err = %e, "relay pull failed");
                    group.clear_pull_attempt();
                }
                Ok(session) => {
                    if group.add_rtmp_pull_session(Arc::clone(&session)) {
                        session.wait().await;
                        info!(unique_key = %group.unique_key, session = %session.unique_key(), "relay pull done");
                        group.del_rtmp_pull_session(&session);
                    } else {
                        session.dispose();
                        group.clear_pull_attempt();
                    }
                }
            }
        });
    }

    fn push_if_needed(&self, inner: &mut GroupInner) {
        if !self.config.relay_push.enable {
            return;
        }
        if inner.rtmp_pub.is_none() && inner.rtsp_pub.is_none() {
            return;
        }
        let Some(group) = self.weak_self.upgrade() else {
            return;
        };

        // relay push carries the rtmp publisher's query string
        let url_param = inner
            .rtmp_pub
            .as_ref()
            .map(|s| s.raw_query().to_string())
            .unwrap_or_default();

        for (url, proxy) in inner.push_proxies.iter_mut() {
            if proxy.is_pushing || proxy.session.is_some() {
                continue;
            }
            proxy.is_pushing = true;

            let url_with_param = if url_param.is_empty() {
                url.clone()
            } else {
                format!("{url}?{url_param}")
            };
            info!(unique_key = %self.unique_key, url = %url_with_param, "start relay push");

            let group = Arc::clone(&group);
            let client = Arc::clone(&self.relay_client);
            let url = url.clone();
            tokio::spawn(async move {
                let opts = RelayOptions::default();
                match client.push(&url_with_param, &opts).await {
                    Err(e) => {
                        error!(unique_key = %group.unique_key, url = %url_with_param, err = %e, "relay push failed");
                        group.del_rtmp_push_session(&url);
                    }
                    Ok(session) => {
                        group.add_rtmp_push_session(&url, Arc::clone(&session));
                        session.wait_closed().await;
                        info!(unique_key = %group.unique_key, session = %session.unique_key(), "relay push done");
                        group.del_rtmp_push_session(&url);
                    }
                }
            });
        }
    }

    fn add_rtmp_push_session(&self, url: &str, session: Arc<PushSession>) {
        debug!(unique_key = %self.unique_key, session = %session.unique_key(), url, "add rtmp push session");
        let mut inner = self.inner.lock();
        if let Some(proxy) = inner.push_proxies.get_mut(url) {
            proxy.session = Some(session);
        }
    }

    fn del_rtmp_push_session(&self, url: &str) {
        debug!(unique_key = %self.unique_key, url, "del rtmp push session");
        let mut inner = self.inner.lock();
        if let Some(proxy) = inner.push_proxies.get_mut(url) {
            proxy.session = None;
            proxy.is_pushing = false;
        }
    }

    // --------------------------------------------------------- control

    /// Enable pull-on-demand for this stream, starting immediately if
    /// subscribers are waiting.
    pub fn start_pull(&self, url: &str) {
        let mut inner = self.inner.lock();
        inner.pull_enable = true;
        inner.pull_url = url.to_string();
        self.pull_if_needed(&mut inner);
    }

    /// Dispose a session identified by its unique-key prefix. Returns false
    /// when nothing matches.
    pub fn kick_out_session(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock();
        info!(unique_key = %self.unique_key, session_id, "kick out session");

        if session_id.starts_with(UKP_RTMP_PUB) {
            if let Some(s) = &inner.rtmp_pub {
                s.dispose();
                return true;
            }
        } else if session_id.starts_with(UKP_RTSP_PUB) {
            if let Some(s) = &inner.rtsp_pub {
                s.dispose();
                return true;
            }
        } else if session_id.starts_with(UKP_RTMP_SUB) {
            if let Some(s) = inner.rtmp_subs.remove(session_id) {
                s.dispose();
                return true;
            }
        } else if session_id.starts_with(UKP_FLV_SUB) {
            if let Some(s) = inner.httpflv_subs.remove(session_id) {
                s.dispose();
                return true;
            }
        } else if session_id.starts_with(UKP_TS_SUB) {
            if let Some(s) = inner.httpts_subs.remove(session_id) {
                s.dispose();
                return true;
            }
        } else if session_id.starts_with(UKP_RTSP_SUB) {
            if let Some(s) = inner.rtsp_subs.remove(session_id) {
                s.dispose();
                return true;
            }
        } else {
            error!(unique_key = %self.unique_key, session_id, "kick out session with invalid id format");
        }
        false
    }

    // --------------------------------------------------------- queries

    pub fn has_in_session(&self) -> bool {
        Self::has_in_session_inner(&self.inner.lock())
    }

    pub fn has_out_session(&self) -> bool {
        Self::has_out_session_inner(&self.inner.lock())
    }

    pub fn is_total_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.rtmp_pub.is_none()
            && inner.rtsp_pub.is_none()
            && inner.pull_proxy.session.is_none()
            && inner.rtmp_subs.is_empty()
            && inner.httpflv_subs.is_empty()
            && inner.httpts_subs.is_empty()
            && inner.rtsp_subs.is_empty()
            && inner.hls_muxer.is_none()
            && !inner
                .push_proxies
                .values()
                .any(|p| p.is_pushing || p.session.is_some())
    }

    pub fn is_hls_muxer_alive(&self) -> bool {
        self.inner.lock().hls_muxer.is_some()
    }

    pub fn get_stat(&self) -> StatGroup {
        let inner = self.inner.lock();
        let mut stat = inner.stat.clone();
        stat.stat_pub = inner
            .rtmp_pub
            .as_ref()
            .map(|s| s.get_stat())
            .or_else(|| inner.rtsp_pub.as_ref().map(|s| s.get_stat()));
        stat.pull = inner.pull_proxy.session.as_ref().map(|s| s.get_stat());
        stat.subs = inner
            .rtmp_subs
            .values()
            .map(|s| s.get_stat())
            .chain(inner.httpflv_subs.values().map(|s| s.get_stat()))
            .chain(inner.httpts_subs.values().map(|s| s.get_stat()))
            .chain(inner.rtsp_subs.values().map(|s| s.get_stat()))
            .collect();
        stat
    }

    pub fn debug_stats_string(&self) -> String {
        let sub_count = {
            let inner = self.inner.lock();
            inner.rtmp_subs.len()
                + inner.httpflv_subs.len()
                + inner.httpts_subs.len()
                + inner.rtsp_subs.len()
        };
        if sub_count > DEBUG_STATS_MAX_SUBS {
            return format!(
                "[{}] not logging all stats, sub count={sub_count}",
                self.unique_key
            );
        }
        serde_json::to_string(&self.get_stat()).unwrap_or_default()
    }

    // -------------------------------------------------------- lifecycle

    /// Resolves when the group is disposed.
    pub async fn run_loop(&self) {
        self.exit.notified().await;
    }

    /// Release every owned session and the muxer. The group must not be
    /// used afterwards.
    pub fn dispose(&self) {
        info!(unique_key = %self.unique_key, "lifecycle dispose group");
        self.exit.notify_waiters();

        let mut inner = self.inner.lock();

        if let Some(s) = inner.rtmp_pub.take() {
            s.dispose();
        }
        if let Some(s) = inner.rtsp_pub.take() {
            s.dispose();
        }
        if let Some(s) = inner.pull_proxy.session.take() {
            s.dispose();
        }

        for s in inner.rtmp_subs.values() {
            s.dispose();
        }
        inner.rtmp_subs.clear();
        for s in inner.httpflv_subs.values() {
            s.dispose();
        }
        inner.httpflv_subs.clear();
        for s in inner.httpts_subs.values() {
            s.dispose();
        }
        inner.httpts_subs.clear();
        for s in inner.rtsp_subs.values() {
            s.dispose();
        }
        inner.rtsp_subs.clear();

        self.dispose_hls_muxer(&mut inner);

        if self.config.relay_push.enable {
            for proxy in inner.push_proxies.values_mut() {
                if let Some(s) = proxy.session.take() {
                    s.dispose();
                }
            }
        }
    }

    fn add_in(&self, inner: &mut GroupInner) {
        if self.config.hls.muxer.enable {
            if inner.hls_muxer.is_some() {
                error!(unique_key = %self.unique_key, "hls muxer already exists while adding input");
            }
            let mut muxer = HlsMuxer::new(&self.stream_name, &self.config.hls.muxer);
            muxer.start();
            inner.hls_muxer = Some(muxer);
        }
        if self.config.relay_push.enable {
            self.push_if_needed(inner);
        }
    }

    fn del_in(&self, inner: &mut GroupInner) {
        if self.config.hls.muxer.enable && inner.hls_muxer.is_some() {
            self.dispose_hls_muxer(inner);
        }

        if self.config.relay_push.enable {
            for proxy in inner.push_proxies.values_mut() {
                if let Some(s) = proxy.session.take() {
                    s.dispose();
                }
            }
        }

        inner.gop_cache.clear();
        inner.httpflv_gop_cache.clear();
        inner.avpacket_queue = AvPacketQueue::new();
    }

    fn dispose_hls_muxer(&self, inner: &mut GroupInner) {
        let Some(mut muxer) = inner.hls_muxer.take() else {
            return;
        };
        muxer.dispose();

        if !(self.config.hls.muxer.enable && self.config.hls.cleanup_flag) {
            return;
        }

        let delay_ms = 2
            * u64::from(self.config.hls.muxer.fragment_duration_ms)
            * self.config.hls.muxer.fragment_num as u64;
        let out_path = muxer.out_path().to_path_buf();
        let stream_name = self.stream_name.clone();
        let probe = self.muxer_alive_probe.lock().clone();

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

            if let Some(probe) = probe {
                if probe() {
                    warn!(stream_name, "cancel hls cleanup since muxer alive again");
                    return;
                }
            }
            info!(stream_name, path = %out_path.display(), "cleanup hls file path");
            if let Err(e) = tokio::fs::remove_dir_all(&out_path).await {
                warn!(stream_name, path = %out_path.display(), err = %e, "cleanup hls file path failed");
            }
        });
    }

    fn has_in_session_inner(inner: &GroupInner) -> bool {
        inner.rtmp_pub.is_some() || inner.rtsp_pub.is_some() || inner.pull_proxy.session.is_some()
    }

    fn has_out_session_inner(inner: &GroupInner) -> bool {
        !inner.rtmp_subs.is_empty()
            || !inner.httpflv_subs.is_empty()
            || !inner.httpts_subs.is_empty()
            || !inner.rtsp_subs.is_empty()
    }
}
