// Process-wide owner of the name -> group map. Protocol listeners hand
// accepted sessions here; a once-per-second ticker drives every group's
// liveness/relay policy and reaps groups that have gone empty.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::base::{SessionEventNotify, ServerStartNotify, StatGroup, UpdateNotify};
use crate::config::Config;
use crate::error::{Result, RillError};
use crate::group::{Group, MuxerAliveProbe};
use crate::relay::RelayClient;
use crate::session::{
    HttpflvSubSession, HttptsSubSession, RtmpPubSession, RtmpSubSession, RtspPubSession,
    RtspSubSession,
};

/// Structured notification sink. The transport (HTTP posts, message bus) is
/// outside the core; the default sink drops everything.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_server_start(&self, _info: ServerStartNotify) {}
    async fn on_update(&self, _info: UpdateNotify) {}
    async fn on_pub_start(&self, _info: SessionEventNotify) {}
    async fn on_pub_stop(&self, _info: SessionEventNotify) {}
    async fn on_sub_start(&self, _info: SessionEventNotify) {}
    async fn on_sub_stop(&self, _info: SessionEventNotify) {}
}

pub struct NopEventSink;

#[async_trait]
impl EventSink for NopEventSink {}

pub struct ServerManager {
    config: Arc<Config>,
    relay_client: Arc<dyn RelayClient>,
    event_sink: Arc<dyn EventSink>,
    groups: DashMap<String, Arc<Group>>,
    weak_self: Weak<ServerManager>,
    exit: Notify,
    start_time: String,
}

impl ServerManager {
    pub fn new(
        config: Arc<Config>,
        relay_client: Arc<dyn RelayClient>,
        event_sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            relay_client,
            event_sink,
            groups: DashMap::new(),
            weak_self: weak_self.clone(),
            exit: Notify::new(),
            start_time: chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string(),
        })
    }

    fn group_key(app_name: &str, stream_name: &str) -> String {
        format!("{app_name}/{stream_name}")
    }

    pub fn get_group(&self, app_name: &str, stream_name: &str) -> Option<Arc<Group>> {
        self.groups
            .get(&Self::group_key(app_name, stream_name))
            .map(|g| Arc::clone(g.value()))
    }

    fn get_or_create_group(&self, app_name: &str, stream_name: &str) -> Arc<Group> {
        let key = Self::group_key(app_name, stream_name);
        let entry = self.groups.entry(key).or_insert_with(|| {
            let pull_url = if self.config.relay_pull.enable {
                format!(
                    "rtmp://{}/{app_name}/{stream_name}",
                    self.config.relay_pull.addr
                )
            } else {
                String::new()
            };
            let group = Group::new(
                app_name,
                stream_name,
                self.config.relay_pull.enable,
                &pull_url,
                Arc::clone(&self.config),
                Arc::clone(&self.relay_client),
            );

            // lets the deferred hls cleanup see a successor muxer
            let weak = self.weak_self.clone();
            let (app, stream) = (app_name.to_string(), stream_name.to_string());
            let probe: MuxerAliveProbe = Arc::new(move || {
                weak.upgrade()
                    .and_then(|m| m.get_group(&app, &stream))
                    .map(|g| g.is_hls_muxer_alive())
                    .unwrap_or(false)
            });
            group.set_muxer_alive_probe(probe);
            group
        });
        Arc::clone(entry.value())
    }

    // ------------------------------------------------- session attach

    pub async fn add_rtmp_pub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: Arc<RtmpPubSession>,
    ) -> Result<Arc<Group>> {
        let group = self.get_or_create_group(app_name, stream_name);
        if !group.add_rtmp_pub_session(Arc::clone(&session)) {
            return Err(RillError::InputExists(stream_name.to_string()));
        }
        self.event_sink
            .on_pub_start(self.session_event(app_name, stream_name, &session.get_stat()))
            .await;
        Ok(group)
    }

    pub async fn del_rtmp_pub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: &Arc<RtmpPubSession>,
    ) {
        if let Some(group) = self.get_group(app_name, stream_name) {
            group.del_rtmp_pub_session(session);
            self.event_sink
                .on_pub_stop(self.session_event(app_name, stream_name, &session.get_stat()))
                .await;
        }
    }

    pub async fn add_rtsp_pub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: Arc<RtspPubSession>,
    ) -> Result<Arc<Group>> {
        let group = self.get_or_create_group(app_name, stream_name);
        if !group.add_rtsp_pub_session(Arc::clone(&session)) {
            return Err(RillError::InputExists(stream_name.to_string()));
        }
        self.event_sink
            .on_pub_start(self.session_event(app_name, stream_name, &session.get_stat()))
            .await;
        Ok(group)
    }

    pub async fn del_rtsp_pub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: &Arc<RtspPubSession>,
    ) {
        if let Some(group) = self.get_group(app_name, stream_name) {
            group.del_rtsp_pub_session(session);
            self.event_sink
                .on_pub_stop(self.session_event(app_name, stream_name, &session.get_stat()))
                .await;
        }
    }

    pub async fn add_rtmp_sub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: Arc<RtmpSubSession>,
    ) -> Arc<Group> {
        let group = self.get_or_create_group(app_name, stream_name);
        let stat = session.get_stat();
        group.add_rtmp_sub_session(session);
        self.event_sink
            .on_sub_start(self.session_event(app_name, stream_name, &stat))
            .await;
        group
    }

    pub async fn del_rtmp_sub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: &Arc<RtmpSubSession>,
    ) {
        if let Some(group) = self.get_group(app_name, stream_name) {
            group.del_rtmp_sub_session(session);
            self.event_sink
                .on_sub_stop(self.session_event(app_name, stream_name, &session.get_stat()))
                .await;
        }
    }

    pub async fn add_httpflv_sub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: Arc<HttpflvSubSession>,
    ) -> Arc<Group> {
        let group = self.get_or_create_group(app_name, stream_name);
        let stat = session.get_stat();
        group.add_httpflv_sub_session(session);
        self.event_sink
            .on_sub_start(self.session_event(app_name, stream_name, &stat))
            .await;
        group
    }

    pub async fn del_httpflv_sub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: &Arc<HttpflvSubSession>,
    ) {
        if let Some(group) = self.get_group(app_name, stream_name) {
            group.del_httpflv_sub_session(session);
            self.event_sink
                .on_sub_stop(self.session_event(app_name, stream_name, &session.get_stat()))
                .await;
        }
    }

    pub async fn add_httpts_sub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: Arc<HttptsSubSession>,
    ) -> Arc<Group> {
        let group = self.get_or_create_group(app_name, stream_name);
        let stat = session.get_stat();
        group.add_httpts_sub_session(session);
        self.event_sink
            .on_sub_start(self.session_event(app_name, stream_name, &stat))
            .await;
        group
    }

    pub async fn del_httpts_sub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: &Arc<HttptsSubSession>,
    ) {
        if let Some(group) = self.get_group(app_name, stream_name) {
            group.del_httpts_sub_session(session);
            self.event_sink
                .on_sub_stop(self.session_event(app_name, stream_name, &session.get_stat()))
                .await;
        }
    }

    pub async fn add_rtsp_sub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: Arc<RtspSubSession>,
    ) -> Arc<Group> {
        let group = self.get_or_create_group(app_name, stream_name);
        let stat = session.get_stat();
        group.add_rtsp_sub_session(session);
        self.event_sink
            .on_sub_start(self.session_event(app_name, stream_name, &stat))
            .await;
        group
    }

    pub async fn del_rtsp_sub_session(
        &self,
        app_name: &str,
        stream_name: &str,
        session: &Arc<RtspSubSession>,
    ) {
        if let Some(group) = self.get_group(app_name, stream_name) {
            group.del_rtsp_sub_session(session);
            self.event_sink
                .on_sub_stop(self.session_event(app_name, stream_name, &session.get_stat()))
                .await;
        }
    }

    // ---------------------------------------------------- control api

    pub fn ctrl_start_pull(&self, app_name: &str, stream_name: &str, url: &str) {
        info!(app_name, stream_name, url, "api start pull");
        let group = self.get_or_create_group(app_name, stream_name);
        group.start_pull(url);
    }

    pub fn ctrl_kick_out_session(&self, stream_name: &str, session_id: &str) -> Result<()> {
        for entry in self.groups.iter() {
            if entry.value().stream_name() == stream_name {
                return if entry.value().kick_out_session(session_id) {
                    Ok(())
                } else {
                    Err(RillError::SessionNotFound(session_id.to_string()))
                };
            }
        }
        Err(RillError::GroupNotFound(stream_name.to_string()))
    }

    pub fn stat_group(&self, stream_name: &str) -> Option<StatGroup> {
        self.groups
            .iter()
            .find(|entry| entry.value().stream_name() == stream_name)
            .map(|entry| entry.value().get_stat())
    }

    pub fn stat_all_groups(&self) -> Vec<StatGroup> {
        self.groups
            .iter()
            .map(|entry| entry.value().get_stat())
            .collect()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    // -------------------------------------------------------- lifecycle

    /// Spawn the once-per-second ticker. Each pass ticks every group, reaps
    /// the empty ones, and periodically emits aggregate stats.
    pub fn start_ticker(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.event_sink
                .on_server_start(ServerStartNotify {
                    server_id: self.config.server_id.clone(),
                    start_time: self.start_time.clone(),
                })
                .await;

            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut elapsed_sec = 0u32;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick_once();
                        elapsed_sec = elapsed_sec.wrapping_add(1);
                        let update_interval = self.config.http_notify.update_interval_sec;
                        if self.config.http_notify.enable
                            && update_interval > 0
                            && elapsed_sec % update_interval == 0
                        {
                            self.event_sink
                                .on_update(UpdateNotify {
                                    server_id: self.config.server_id.clone(),
                                    groups: self.stat_all_groups(),
                                })
                                .await;
                        }
                    }
                    () = self.exit.notified() => break,
                }
            }
        })
    }

    fn tick_once(&self) {
        let mut empty_keys = Vec::new();
        for entry in self.groups.iter() {
            entry.value().tick();
            if entry.value().is_total_empty() {
                empty_keys.push(entry.key().clone());
            }
        }
        for key in empty_keys {
            if let Some((key, group)) = self.groups.remove(&key) {
                // a session may have raced in between the check and removal
                if group.is_total_empty() {
                    info!(group = %group.unique_key, key = %key, "reap empty group");
                    group.dispose();
                } else {
                    self.groups.insert(key, group);
                }
            }
        }
    }

    pub fn dispose(&self) {
        info!("lifecycle dispose server manager");
        self.exit.notify_waiters();
        for entry in self.groups.iter() {
            entry.value().dispose();
        }
        self.groups.clear();
    }

    fn session_event(
        &self,
        app_name: &str,
        stream_name: &str,
        stat: &crate::base::StatSession,
    ) -> SessionEventNotify {
        SessionEventNotify {
            server_id: self.config.server_id.clone(),
            app_name: app_name.to_string(),
            stream_name: stream_name.to_string(),
            protocol: stat.protocol.clone(),
            session_id: stat.session_id.clone(),
            remote_addr: stat.remote_addr.clone(),
        }
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        if !self.groups.is_empty() {
            warn!("server manager dropped with live groups");
        }
    }
}
