// Core-owned session shells. Wire codecs live outside the crate and feed
// these objects: publishers push parsed messages in through the group,
// subscribers drain pre-serialized bytes out through a bounded write queue.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::base::{
    gen_unique_key, RtpPacket, SdpContext, StatSession, UKP_FLV_SUB, UKP_RTMP_PUB, UKP_RTMP_PULL,
    UKP_RTMP_PUSH, UKP_RTMP_SUB, UKP_RTSP_PUB, UKP_RTSP_SUB, UKP_TS_SUB,
};

pub const PROTOCOL_RTMP: &str = "RTMP";
pub const PROTOCOL_HTTPFLV: &str = "HTTPFLV";
pub const PROTOCOL_HTTPTS: &str = "HTTPTS";
pub const PROTOCOL_RTSP: &str = "RTSP";

pub const SUB_WRITE_CHAN_SIZE: usize = 1024;
/// Push proxies get more slack before the overflow policy kills them.
pub const RELAY_PUSH_WRITE_CHAN_SIZE: usize = 4096;

pub const FLV_HTTP_RESPONSE_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\
Server: rill\r\n\
Cache-Control: no-cache\r\n\
Content-Type: video/x-flv\r\n\
Connection: close\r\n\
Expires: -1\r\n\
Pragma: no-cache\r\n\
Access-Control-Allow-Origin: *\r\n\
\r\n";

pub const TS_HTTP_RESPONSE_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\
Server: rill\r\n\
Cache-Control: no-cache\r\n\
Content-Type: video/mp2t\r\n\
Connection: close\r\n\
Expires: -1\r\n\
Pragma: no-cache\r\n\
Access-Control-Allow-Origin: *\r\n\
\r\n";

pub type SessionSink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default, Clone, Copy)]
struct ByteSample {
    read: u64,
    wrote: u64,
}

#[derive(Default, Clone, Copy)]
struct Bitrates {
    read_kbitps: u32,
    write_kbitps: u32,
}

/// Byte counters, bitrate windows, and liveness sampling shared by every
/// session variant. Ingress shims bump the read counter; the write queue
/// bumps the wrote counter.
pub struct SessionCore {
    pub unique_key: String,
    protocol: &'static str,
    start_time: String,
    remote_addr: String,
    read_bytes: AtomicU64,
    wrote_bytes: AtomicU64,
    prev_sample: Mutex<ByteSample>,
    stale_sample: Mutex<Option<ByteSample>>,
    bitrates: Mutex<Bitrates>,
    disposed: AtomicBool,
}

impl SessionCore {
    pub fn new(key_prefix: &str, protocol: &'static str, remote_addr: &str) -> Self {
        Self {
            unique_key: gen_unique_key(key_prefix),
            protocol,
            start_time: chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string(),
            remote_addr: remote_addr.to_string(),
            read_bytes: AtomicU64::new(0),
            wrote_bytes: AtomicU64::new(0),
            prev_sample: Mutex::new(ByteSample::default()),
            stale_sample: Mutex::new(None),
            bitrates: Mutex::new(Bitrates::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn add_read_bytes(&self, n: u64) {
        self.read_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_wrote_bytes(&self, n: u64) {
        self.wrote_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Marks disposed; returns true on the first call only.
    pub fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// (read_alive, write_alive) since the previous sample. The first call
    /// seeds the sample and reports alive.
    pub fn is_alive(&self) -> (bool, bool) {
        let now = ByteSample {
            read: self.read_bytes.load(Ordering::Relaxed),
            wrote: self.wrote_bytes.load(Ordering::Relaxed),
        };
        let mut stale = self.stale_sample.lock();
        match stale.as_mut() {
            None => {
                *stale = Some(now);
                (true, true)
            }
            Some(prev) => {
                let alive = (now.read != prev.read, now.wrote != prev.wrote);
                *prev = now;
                alive
            }
        }
    }

    /// Recompute the bitrate window over `interval_sec`.
    pub fn update_stat(&self, interval_sec: u32) {
        let now = ByteSample {
            read: self.read_bytes.load(Ordering::Relaxed),
            wrote: self.wrote_bytes.load(Ordering::Relaxed),
        };
        let mut prev = self.prev_sample.lock();
        let interval = u64::from(interval_sec.max(1));
        let rates = Bitrates {
            read_kbitps: ((now.read - prev.read) * 8 / 1024 / interval) as u32,
            write_kbitps: ((now.wrote - prev.wrote) * 8 / 1024 / interval) as u32,
        };
        *prev = now;
        *self.bitrates.lock() = rates;
    }

    pub fn get_stat(&self) -> StatSession {
        let rates = *self.bitrates.lock();
        StatSession {
            protocol: self.protocol.to_string(),
            session_id: self.unique_key.clone(),
            start_time: self.start_time.clone(),
            remote_addr: self.remote_addr.clone(),
            read_bytes_sum: self.read_bytes.load(Ordering::Relaxed),
            wrote_bytes_sum: self.wrote_bytes.load(Ordering::Relaxed),
            bitrate_kbitps: rates.write_kbitps,
            read_bitrate_kbitps: rates.read_kbitps,
            write_bitrate_kbitps: rates.write_kbitps,
        }
    }
}

/// Bounded queue between the broadcast path and a session's socket. The
/// broadcast enqueues without blocking; a writer task drains into the sink.
/// Overflow closes the queue: dropping individual media buffers would
/// corrupt the stream, so the session dies instead and the liveness sweep
/// reaps it.
pub struct WriteQueue {
    unique_key: String,
    tx: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
    done: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    pub fn spawn(
        unique_key: String,
        sink: SessionSink,
        capacity: usize,
        core: Arc<SessionCore>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let done = Arc::new(Notify::new());

        let task_closed = Arc::clone(&closed);
        let task_done = Arc::clone(&done);
        let task_key = unique_key.clone();
        let task = tokio::spawn(async move {
            let mut sink = sink;
            while let Some(buf) = rx.recv().await {
                if let Err(e) = sink.write_all(&buf).await {
                    debug!(unique_key = %task_key, err = %e, "session write failed");
                    break;
                }
                core.add_wrote_bytes(buf.len() as u64);
            }
            let _ = sink.shutdown().await;
            task_closed.store(true, Ordering::SeqCst);
            task_done.notify_waiters();
        });

        Self {
            unique_key,
            tx,
            closed,
            done,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn enqueue(&self, buf: Bytes) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match self.tx.try_send(buf) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(unique_key = %self.unique_key, "write queue full, closing session");
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the writer task has exited (sink error, channel close,
    /// or abort).
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.done.notify_waiters();
    }
}

macro_rules! impl_sub_session_common {
    ($t:ty) => {
        impl $t {
            pub fn unique_key(&self) -> &str {
                &self.core.unique_key
            }

            pub fn is_alive(&self) -> (bool, bool) {
                self.core.is_alive()
            }

            pub fn update_stat(&self, interval_sec: u32) {
                self.core.update_stat(interval_sec)
            }

            pub fn get_stat(&self) -> StatSession {
                self.core.get_stat()
            }

            pub fn dispose(&self) {
                if self.core.mark_disposed() {
                    info!(unique_key = %self.core.unique_key, "lifecycle dispose session");
                    self.queue.close();
                }
            }
        }
    };
}

/// RTMP playback session; receives pre-chunked bytes.
pub struct RtmpSubSession {
    pub core: Arc<SessionCore>,
    pub is_fresh: AtomicBool,
    queue: WriteQueue,
}

impl RtmpSubSession {
    pub fn new(remote_addr: &str, sink: SessionSink) -> Self {
        let core = Arc::new(SessionCore::new(UKP_RTMP_SUB, PROTOCOL_RTMP, remote_addr));
        let queue = WriteQueue::spawn(
            core.unique_key.clone(),
            sink,
            SUB_WRITE_CHAN_SIZE,
            Arc::clone(&core),
        );
        Self {
            core,
            is_fresh: AtomicBool::new(true),
            queue,
        }
    }

    pub fn async_write(&self, buf: Bytes) -> bool {
        self.queue.enqueue(buf)
    }
}

impl_sub_session_common!(RtmpSubSession);

/// HTTP-FLV playback session; receives FLV-tagged bytes. The HTTP response
/// header and the FLV file header are its first two writes.
pub struct HttpflvSubSession {
    pub core: Arc<SessionCore>,
    pub is_fresh: AtomicBool,
    queue: WriteQueue,
}

impl HttpflvSubSession {
    pub fn new(remote_addr: &str, sink: SessionSink) -> Self {
        let core = Arc::new(SessionCore::new(UKP_FLV_SUB, PROTOCOL_HTTPFLV, remote_addr));
        let queue = WriteQueue::spawn(
            core.unique_key.clone(),
            sink,
            SUB_WRITE_CHAN_SIZE,
            Arc::clone(&core),
        );
        Self {
            core,
            is_fresh: AtomicBool::new(true),
            queue,
        }
    }

    pub fn write_raw_packet(&self, buf: Bytes) -> bool {
        self.queue.enqueue(buf)
    }
}

impl_sub_session_common!(HttpflvSubSession);

/// HTTP-TS playback session; receives raw TS packets. Stays fresh until a
/// segment boundary so it never joins mid-segment.
pub struct HttptsSubSession {
    pub core: Arc<SessionCore>,
    pub is_fresh: AtomicBool,
    queue: WriteQueue,
}

impl HttptsSubSession {
    pub fn new(remote_addr: &str, sink: SessionSink) -> Self {
        let core = Arc::new(SessionCore::new(UKP_TS_SUB, PROTOCOL_HTTPTS, remote_addr));
        let queue = WriteQueue::spawn(
            core.unique_key.clone(),
            sink,
            SUB_WRITE_CHAN_SIZE,
            Arc::clone(&core),
        );
        Self {
            core,
            is_fresh: AtomicBool::new(true),
            queue,
        }
    }

    pub fn write_raw_packet(&self, buf: Bytes) -> bool {
        self.queue.enqueue(buf)
    }
}

impl_sub_session_common!(HttptsSubSession);

/// RTSP playback session; receives tunneled RTP packets routed by payload
/// type against the publisher's SDP context.
pub struct RtspSubSession {
    pub core: Arc<SessionCore>,
    sdp: Mutex<SdpContext>,
    queue: WriteQueue,
}

impl RtspSubSession {
    pub fn new(remote_addr: &str, sdp: SdpContext, sink: SessionSink) -> Self {
        let core = Arc::new(SessionCore::new(UKP_RTSP_SUB, PROTOCOL_RTSP, remote_addr));
        let queue = WriteQueue::spawn(
            core.unique_key.clone(),
            sink,
            SUB_WRITE_CHAN_SIZE,
            Arc::clone(&core),
        );
        Self {
            core,
            sdp: Mutex::new(sdp),
            queue,
        }
    }

    pub fn write_rtp_packet(&self, pkt: &RtpPacket) -> bool {
        // track selection is wire-level; the SDP context only decides
        // whether the packet belongs to a subscribed track at all
        let sdp = self.sdp.lock();
        if sdp.audio_payload_type != Some(pkt.payload_type)
            && sdp.video_payload_type != Some(pkt.payload_type)
        {
            return true;
        }
        drop(sdp);
        self.queue.enqueue(pkt.raw.clone())
    }
}

impl_sub_session_common!(RtspSubSession);

/// RTMP publish session shell. The wire-side read loop bumps the core's
/// read counter and observes `cancelled()` for teardown.
pub struct RtmpPubSession {
    pub core: Arc<SessionCore>,
    raw_query: String,
    shutdown: Notify,
}

impl RtmpPubSession {
    pub fn new(remote_addr: &str, raw_query: &str) -> Self {
        Self {
            core: Arc::new(SessionCore::new(UKP_RTMP_PUB, PROTOCOL_RTMP, remote_addr)),
            raw_query: raw_query.to_string(),
            shutdown: Notify::new(),
        }
    }

    pub fn unique_key(&self) -> &str {
        &self.core.unique_key
    }

    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }

    pub fn is_alive(&self) -> (bool, bool) {
        self.core.is_alive()
    }

    pub fn update_stat(&self, interval_sec: u32) {
        self.core.update_stat(interval_sec)
    }

    pub fn get_stat(&self) -> StatSession {
        self.core.get_stat()
    }

    pub fn dispose(&self) {
        if self.core.mark_disposed() {
            info!(unique_key = %self.core.unique_key, "lifecycle dispose session");
            self.shutdown.notify_waiters();
        }
    }

    pub async fn cancelled(&self) {
        if self.core.is_disposed() {
            return;
        }
        self.shutdown.notified().await;
    }
}

/// RTSP publish session shell; additionally carries the SDP track layout.
pub struct RtspPubSession {
    pub core: Arc<SessionCore>,
    sdp: Mutex<SdpContext>,
    shutdown: Notify,
}

impl RtspPubSession {
    pub fn new(remote_addr: &str) -> Self {
        Self {
            core: Arc::new(SessionCore::new(UKP_RTSP_PUB, PROTOCOL_RTSP, remote_addr)),
            sdp: Mutex::new(SdpContext::default()),
            shutdown: Notify::new(),
        }
    }

    pub fn unique_key(&self) -> &str {
        &self.core.unique_key
    }

    pub fn set_sdp_context(&self, sdp: SdpContext) {
        *self.sdp.lock() = sdp;
    }

    pub fn sdp_context(&self) -> SdpContext {
        self.sdp.lock().clone()
    }

    pub fn is_alive(&self) -> (bool, bool) {
        self.core.is_alive()
    }

    pub fn update_stat(&self, interval_sec: u32) {
        self.core.update_stat(interval_sec)
    }

    pub fn get_stat(&self) -> StatSession {
        self.core.get_stat()
    }

    pub fn dispose(&self) {
        if self.core.mark_disposed() {
            info!(unique_key = %self.core.unique_key, "lifecycle dispose session");
            self.shutdown.notify_waiters();
        }
    }

    pub async fn cancelled(&self) {
        if self.core.is_disposed() {
            return;
        }
        self.shutdown.notified().await;
    }
}

/// Relay pull handle. The relay client delivers messages through the group
/// and completes the handle when the upstream ends.
pub struct PullSession {
    pub core: Arc<SessionCore>,
    shutdown: Notify,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl PullSession {
    pub fn new(remote_addr: &str) -> Self {
        let (done_tx, done_rx) = oneshot::channel();
        Self {
            core: Arc::new(SessionCore::new(UKP_RTMP_PULL, PROTOCOL_RTMP, remote_addr)),
            shutdown: Notify::new(),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    pub fn unique_key(&self) -> &str {
        &self.core.unique_key
    }

    pub fn is_alive(&self) -> (bool, bool) {
        self.core.is_alive()
    }

    pub fn update_stat(&self, interval_sec: u32) {
        self.core.update_stat(interval_sec)
    }

    pub fn get_stat(&self) -> StatSession {
        self.core.get_stat()
    }

    pub fn dispose(&self) {
        if self.core.mark_disposed() {
            info!(unique_key = %self.core.unique_key, "lifecycle dispose session");
            self.shutdown.notify_waiters();
        }
    }

    /// Awaited by the relay client's read loop to observe cancellation.
    pub async fn cancelled(&self) {
        if self.core.is_disposed() {
            return;
        }
        self.shutdown.notified().await;
    }

    /// Called by the relay client when the upstream session ends.
    pub fn mark_done(&self) {
        if let Some(tx) = self.done_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Resolves when the session ends (error, EOF, or dispose).
    pub async fn wait(&self) {
        let rx = self.done_rx.lock().take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

/// Relay push handle; an output session whose sink is the handshaken
/// upstream connection.
pub struct PushSession {
    pub core: Arc<SessionCore>,
    pub is_fresh: AtomicBool,
    queue: WriteQueue,
}

impl PushSession {
    pub fn new(remote_addr: &str, sink: SessionSink) -> Self {
        let core = Arc::new(SessionCore::new(UKP_RTMP_PUSH, PROTOCOL_RTMP, remote_addr));
        let queue = WriteQueue::spawn(
            core.unique_key.clone(),
            sink,
            RELAY_PUSH_WRITE_CHAN_SIZE,
            Arc::clone(&core),
        );
        Self {
            core,
            is_fresh: AtomicBool::new(true),
            queue,
        }
    }

    pub fn async_write(&self, buf: Bytes) -> bool {
        self.queue.enqueue(buf)
    }

    /// Resolves when the upstream connection dies or the session is
    /// disposed.
    pub async fn wait_closed(&self) {
        self.queue.wait_closed().await
    }
}

impl_sub_session_common!(PushSession);

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn write_queue_drains_to_sink_and_counts_bytes() {
        let (client, mut server) = tokio::io::duplex(4096);
        let session = RtmpSubSession::new("127.0.0.1:9999", Box::new(client));

        assert!(session.async_write(Bytes::from_static(b"hello ")));
        assert!(session.async_write(Bytes::from_static(b"world")));

        let mut buf = [0u8; 11];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");

        // writer task has recorded the bytes
        tokio::task::yield_now().await;
        assert_eq!(session.get_stat().wrote_bytes_sum, 11);
    }

    #[tokio::test]
    async fn full_queue_closes_the_session() {
        // tiny sink that is never drained
        let (client, _server) = tokio::io::duplex(16);
        let core = Arc::new(SessionCore::new(UKP_RTMP_SUB, PROTOCOL_RTMP, "t"));
        let queue = WriteQueue::spawn("k".to_string(), Box::new(client), 2, core);

        let big = Bytes::from(vec![0u8; 64]);
        // first write blocks the writer on the 16-byte duplex, the next two
        // fill the channel, the fourth overflows
        let mut ok_count = 0;
        for _ in 0..8 {
            if queue.enqueue(big.clone()) {
                ok_count += 1;
            } else {
                break;
            }
        }
        assert!(ok_count < 8);
        assert!(queue.is_closed());
        assert!(!queue.enqueue(big));
    }

    #[tokio::test]
    async fn liveness_sampling() {
        let core = SessionCore::new(UKP_RTMP_PUB, PROTOCOL_RTMP, "t");
        // first probe seeds the sample
        assert_eq!(core.is_alive(), (true, true));
        // no traffic since: dead both ways
        assert_eq!(core.is_alive(), (false, false));
        core.add_read_bytes(100);
        assert_eq!(core.is_alive(), (true, false));
        core.add_wrote_bytes(10);
        assert_eq!(core.is_alive(), (false, true));
    }

    #[tokio::test]
    async fn bitrate_window() {
        let core = SessionCore::new(UKP_RTMP_PUB, PROTOCOL_RTMP, "t");
        core.update_stat(5);
        core.add_wrote_bytes(5 * 1024 * 1024 / 8); // 1024 kbit/s over 5s
        core.update_stat(5);
        let stat = core.get_stat();
        assert_eq!(stat.write_bitrate_kbitps, 1024);
        assert_eq!(stat.bitrate_kbitps, 1024);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let session = HttpflvSubSession::new("t", Box::new(client));
        session.dispose();
        session.dispose();
        assert!(!session.write_raw_packet(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn pull_session_wait_resolves_on_done() {
        let session = Arc::new(PullSession::new("upstream"));
        let s2 = Arc::clone(&session);
        let waiter = tokio::spawn(async move { s2.wait().await });
        session.mark_done();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn rtsp_sub_filters_unknown_payload_types() {
        let (client, _server) = tokio::io::duplex(4096);
        let sdp = SdpContext {
            audio_payload_type: Some(97),
            video_payload_type: Some(96),
            ..Default::default()
        };
        let session = RtspSubSession::new("t", sdp, Box::new(client));
        // unknown payload type is ignored but not an error
        assert!(session.write_rtp_packet(&RtpPacket {
            payload_type: 33,
            raw: Bytes::from_static(b"x"),
        }));
        assert!(session.write_rtp_packet(&RtpPacket {
            payload_type: 96,
            raw: Bytes::from_static(b"v"),
        }));
    }
}
