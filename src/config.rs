use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, RillError};
use crate::hls::MuxerConfig;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server_id: String,
    pub rtmp: RtmpConfig,
    pub httpflv: HttpflvConfig,
    pub hls: HlsConfig,
    pub httpts: HttptsConfig,
    pub rtsp: RtspConfig,
    pub relay_push: RelayPushConfig,
    pub relay_pull: RelayPullConfig,
    pub http_api: HttpApiConfig,
    pub http_notify: HttpNotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    pub enable: bool,
    pub addr: String,
    pub gop_num: usize,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            enable: true,
            addr: ":1935".to_string(),
            gop_num: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpflvConfig {
    pub enable: bool,
    pub sub_listen_addr: String,
    pub gop_num: usize,
}

impl Default for HttpflvConfig {
    fn default() -> Self {
        Self {
            enable: true,
            sub_listen_addr: ":8080".to_string(),
            gop_num: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HlsConfig {
    pub sub_listen_addr: String,
    #[serde(flatten)]
    pub muxer: MuxerConfig,
    pub cleanup_flag: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HttptsConfig {
    pub enable: bool,
    pub sub_listen_addr: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RtspConfig {
    pub enable: bool,
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RelayPushConfig {
    pub enable: bool,
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RelayPullConfig {
    pub enable: bool,
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HttpApiConfig {
    pub enable: bool,
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpNotifyConfig {
    pub enable: bool,
    pub update_interval_sec: u32,
    pub on_server_start: String,
    pub on_update: String,
    pub on_pub_start: String,
    pub on_pub_stop: String,
    pub on_sub_start: String,
    pub on_sub_stop: String,
    pub on_rtmp_connect: String,
}

impl Default for HttpNotifyConfig {
    fn default() -> Self {
        Self {
            enable: false,
            update_interval_sec: 10,
            on_server_start: String::new(),
            on_update: String::new(),
            on_pub_start: String::new(),
            on_pub_stop: String::new(),
            on_sub_start: String::new(),
            on_sub_stop: String::new(),
            on_rtmp_connect: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| RillError::Config(format!("parse config: {e}")))?;

        for key in [
            "rtmp",
            "httpflv",
            "hls",
            "httpts",
            "rtsp",
            "relay_push",
            "relay_pull",
            "http_api",
            "http_notify",
        ] {
            if value.get(key).is_none() {
                warn!(key, "missing config item");
            }
        }

        serde_json::from_value(value).map_err(|e| RillError::Config(format!("parse config: {e}")))
    }
}
