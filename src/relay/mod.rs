// Client-side relay seam. Handshakes and wire I/O for outgoing RTMP
// sessions live behind this trait so the group's pull/push controllers can
// be driven by a real client in production and a scripted one in tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::base::RtmpMsg;
use crate::error::{Result, RillError};
use crate::session::{PullSession, PushSession};

pub const RELAY_PULL_TIMEOUT_MS: u64 = 5000;
pub const RELAY_PULL_READ_AV_TIMEOUT_MS: u64 = 5000;
pub const RELAY_PUSH_TIMEOUT_MS: u64 = 5000;
pub const RELAY_PUSH_WRITE_AV_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Bound on the connect/handshake phase.
    pub pull_timeout_ms: u64,
    /// Idleness bound on the pulled media stream.
    pub read_av_timeout_ms: u64,
    pub push_timeout_ms: u64,
    pub write_av_timeout_ms: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            pull_timeout_ms: RELAY_PULL_TIMEOUT_MS,
            read_av_timeout_ms: RELAY_PULL_READ_AV_TIMEOUT_MS,
            push_timeout_ms: RELAY_PUSH_TIMEOUT_MS,
            write_av_timeout_ms: RELAY_PUSH_WRITE_AV_TIMEOUT_MS,
        }
    }
}

pub type OnRtmpMsg = Arc<dyn Fn(RtmpMsg) + Send + Sync>;

/// Outgoing RTMP session factory.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Connect to `url` and start playing. Returns once the handshake
    /// completes; demuxed messages flow into `sink` from a background task
    /// until EOF, error, timeout, or `PullSession::dispose`, after which the
    /// session is marked done.
    async fn pull(
        &self,
        url: &str,
        opts: &RelayOptions,
        sink: OnRtmpMsg,
    ) -> Result<Arc<PullSession>>;

    /// Connect to `url` and start publishing. The returned session's write
    /// queue drains into the upstream connection.
    async fn push(&self, url: &str, opts: &RelayOptions) -> Result<Arc<PushSession>>;
}

/// Default client for deployments without a relay stack; every attempt
/// fails with a typed error and the controllers back off.
pub struct NoopRelayClient;

#[async_trait]
impl RelayClient for NoopRelayClient {
    async fn pull(
        &self,
        _url: &str,
        _opts: &RelayOptions,
        _sink: OnRtmpMsg,
    ) -> Result<Arc<PullSession>> {
        Err(RillError::Relay("relay client not configured".into()))
    }

    async fn push(&self, _url: &str, _opts: &RelayOptions) -> Result<Arc<PushSession>> {
        Err(RillError::Relay("relay client not configured".into()))
    }
}
