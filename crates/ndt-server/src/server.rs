//! # Server Driver
//!
//! One task owns the control listener and applies scheduler actions. Login,
//! zombie probes and sessions run in their own tasks and report back over
//! an event channel, so the driver never blocks on a slow client.
//!
//! ```text
//!   accept ─► login task ──LoggedIn──┐
//!   session task ─────────Finished───┼─► driver ─► SchedulerHandle
//!   probe task ───────────Probed─────┘      ▲
//!   interval (tick_secs) ───────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ndt_proto::login::parse_login;
use ndt_proto::{LoginRequest, MessageType, ProtocolError, QueueStatus, SessionId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::capture::CaptureOpener;
use crate::config::ServerConfig;
use crate::control::ControlChannel;
use crate::counters::CounterStore;
use crate::listener::{bind_listener, ListenOptions, PortAllocator};
use crate::record::RecordSink;
use crate::scheduler::{Action, Admission, Arrival, SchedulerHandle, SchedulerState};
use crate::session::{self, Endpoints, SessionEnv};

type Control = ControlChannel<TcpStream>;

/// How long shutdown waits for cancelled sessions to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

enum Event {
    LoggedIn {
        id: SessionId,
        client: SocketAddr,
        login: LoginRequest,
        ctl: Control,
    },
    Finished {
        id: SessionId,
    },
    /// `waiting` is `None` when the client failed the heartbeat.
    Probed {
        id: SessionId,
        waiting: Option<Waiting>,
    },
}

struct Waiting {
    client: SocketAddr,
    login: LoginRequest,
    ctl: Control,
}

struct Worker {
    cancel: watch::Sender<Option<QueueStatus>>,
    handle: JoinHandle<()>,
}

pub struct Server {
    env: SessionEnv,
    listener: TcpListener,
    scheduler: SchedulerHandle,
}

impl Server {
    /// Bind the control port.
    pub fn bind(
        config: ServerConfig,
        store: Arc<dyn CounterStore>,
        capture: Option<Arc<dyn CaptureOpener>>,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(config.bind_addr, config.ports.control);
        let listener = bind_listener(addr, ListenOptions::default())
            .with_context(|| format!("failed to bind control port {}", addr))?;
        let scheduler = SchedulerHandle::new(SchedulerState::from_config(&config));
        let records = config.log_dir.clone().map(RecordSink::new);
        let env = SessionEnv {
            ports: PortAllocator::new(&config),
            config: Arc::new(config),
            store,
            capture,
            records,
        };
        Ok(Server {
            env,
            listener,
            scheduler,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.env.config
    }

    /// Serve until `shutdown` flips to `true` (or its sender goes away).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut driver = Driver {
            env: self.env,
            scheduler: self.scheduler,
            events: events_tx,
            waiting: HashMap::new(),
            workers: HashMap::new(),
        };
        let mut tick = tokio::time::interval(driver.env.config.timeouts.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            addr = %self.listener.local_addr()?,
            multiple = driver.env.config.multiple,
            max_clients = driver.env.config.max_clients,
            "NDT server listening"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => driver.spawn_login(stream, peer),
                    Err(e) => tracing::warn!(error = %e, "control accept failed"),
                },
                Some(event) = events_rx.recv() => driver.handle(event).await,
                _ = tick.tick() => {
                    let actions = driver.scheduler.tick().await;
                    driver.apply(actions).await;
                }
            }
        }

        driver.shutdown().await;
        Ok(())
    }
}

// ─── Driver ──────────────────────────────────────────────────────────────────

struct Driver {
    env: SessionEnv,
    scheduler: SchedulerHandle,
    events: mpsc::UnboundedSender<Event>,
    waiting: HashMap<SessionId, Waiting>,
    workers: HashMap<SessionId, Worker>,
}

impl Driver {
    fn spawn_login(&self, stream: TcpStream, peer: SocketAddr) {
        let scheduler = self.scheduler.clone();
        let events = self.events.clone();
        let wait = self.env.config.timeouts.login;
        tokio::spawn(async move {
            if let Some((login, ctl)) = admit(stream, peer, &scheduler, wait).await {
                let _ = events.send(Event::LoggedIn {
                    id: SessionId::new(),
                    client: peer,
                    login,
                    ctl,
                });
            }
        });
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::LoggedIn { id, client, login, mut ctl } => {
                let arrival = Arrival {
                    id: id.clone(),
                    client,
                    status_capable: login.suite.status_capable(),
                };
                match self.scheduler.submit(arrival).await {
                    Admission::Dispatch => self.spawn_worker(id, client, login, ctl),
                    Admission::Queued { position } => {
                        tracing::info!(session = %id, %client, ?position, "client queued");
                        if let Some(p) = position {
                            if !self.notify(&mut ctl, QueueStatus::Position(p)).await {
                                self.scheduler.reap(&id).await;
                                return;
                            }
                        }
                        self.waiting.insert(id, Waiting { client, login, ctl });
                    }
                    Admission::Rejected(status) => {
                        tracing::info!(%client, %status, "client rejected");
                        self.notify(&mut ctl, status).await;
                    }
                }
            }
            Event::Finished { id } => {
                self.workers.remove(&id);
                self.scheduler.reap(&id).await;
                let actions = self.scheduler.tick().await;
                self.apply(actions).await;
            }
            Event::Probed { id, waiting } => {
                let removed = self.scheduler.probe_finished(&id, waiting.is_some()).await;
                if removed {
                    tracing::info!(session = %id, "evicted unresponsive queued client");
                }
                if let Some(mut w) = waiting {
                    if self.scheduler.contains(&id).await {
                        self.waiting.insert(id, w);
                    } else {
                        // A reset while the probe ran already dropped the entry.
                        tracing::info!(session = %id, "queue reset during heartbeat, turning client away");
                        self.notify(&mut w.ctl, QueueStatus::ServerBusy).await;
                    }
                }
            }
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Dispatch(id) => match self.waiting.remove(&id) {
                    Some(w) => self.spawn_worker(id, w.client, w.login, w.ctl),
                    None => {
                        tracing::warn!(session = %id, "dispatched session has no connection");
                        self.scheduler.reap(&id).await;
                    }
                },
                Action::Notify { id, status } => {
                    let Some(mut w) = self.waiting.remove(&id) else {
                        continue;
                    };
                    if self.notify(&mut w.ctl, status).await {
                        self.waiting.insert(id, w);
                    } else {
                        tracing::info!(session = %id, "queued client went away");
                        self.scheduler.reap(&id).await;
                    }
                }
                Action::Evict(id) => {
                    tracing::warn!(session = %id, "evicting stale session at queue head");
                    self.cancel(&id, QueueStatus::ServerBusy).await;
                }
                Action::Probe(ids) => {
                    for id in ids {
                        if let Some(w) = self.waiting.remove(&id) {
                            self.spawn_probe(id, w);
                        }
                    }
                }
                Action::Reset { sessions, fault } => {
                    tracing::error!(%fault, sessions = sessions.len(), "scheduler fault, resetting queue");
                    let ids: Vec<SessionId> = self
                        .workers
                        .keys()
                        .chain(self.waiting.keys())
                        .cloned()
                        .collect();
                    for id in ids {
                        self.cancel(&id, QueueStatus::ServerBusy).await;
                    }
                }
            }
        }
    }

    fn spawn_worker(&mut self, id: SessionId, client: SocketAddr, login: LoginRequest, ctl: Control) {
        let stream = ctl.get_ref();
        let ends = Endpoints {
            server_ip: stream
                .local_addr()
                .map(|a| a.ip())
                .unwrap_or(self.env.config.bind_addr),
            client_ip: client.ip(),
            control_fd: Some(stream.as_raw_fd()),
        };
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let env = self.env.clone();
        let events = self.events.clone();
        let span = tracing::info_span!("session", id = %id, client = %client);
        let worker_id = id.clone();
        let handle = tokio::spawn(
            async move {
                match session::run(&env, worker_id.clone(), login, ctl, ends, cancel_rx).await {
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "session ended early"),
                }
                let _ = events.send(Event::Finished { id: worker_id });
            }
            .instrument(span),
        );
        self.workers.insert(
            id,
            Worker {
                cancel: cancel_tx,
                handle,
            },
        );
    }

    fn spawn_probe(&self, id: SessionId, mut w: Waiting) {
        let events = self.events.clone();
        let wait = self.env.config.timeouts.probe;
        tokio::spawn(async move {
            let alive = probe_client(&mut w.ctl, wait).await;
            tracing::debug!(session = %id, alive, "zombie probe finished");
            let _ = events.send(Event::Probed {
                id,
                waiting: alive.then_some(w),
            });
        });
    }

    /// Send a queue status, bounded by the probe wait.
    async fn notify(&self, ctl: &mut Control, status: QueueStatus) -> bool {
        matches!(
            tokio::time::timeout(self.env.config.timeouts.probe, ctl.send_queue(status)).await,
            Ok(Ok(()))
        )
    }

    /// Stop a running or waiting session with `status`.
    async fn cancel(&mut self, id: &SessionId, status: QueueStatus) {
        if let Some(w) = self.workers.get(id) {
            let _ = w.cancel.send(Some(status));
        } else if let Some(mut w) = self.waiting.remove(id) {
            self.notify(&mut w.ctl, status).await;
        }
    }

    async fn shutdown(mut self) {
        let drained = self.scheduler.drain().await;
        tracing::info!(sessions = drained.len(), "received shutdown, cancelling sessions");
        let waiting: Vec<SessionId> = self.waiting.keys().cloned().collect();
        for id in waiting {
            self.cancel(&id, QueueStatus::ServerFault).await;
        }
        let mut handles = Vec::new();
        for (_, w) in self.workers.drain() {
            let _ = w.cancel.send(Some(QueueStatus::ServerFault));
            handles.push(w.handle);
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("sessions still running at shutdown");
        }
    }
}

// ─── Client I/O ──────────────────────────────────────────────────────────────

/// Capacity check and login for a new control connection.
async fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    scheduler: &SchedulerHandle,
    wait: Duration,
) -> Option<(LoginRequest, Control)> {
    let _ = stream.set_nodelay(true);
    let mut ctl = ControlChannel::new(stream);
    if let Err(status) = scheduler.check_capacity().await {
        tracing::info!(%peer, %status, "server full, turning client away");
        let _ = ctl.send_queue(status).await;
        return None;
    }
    let frame = match ctl.recv(wait).await {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "no login");
            return None;
        }
    };
    match parse_login(&frame) {
        Ok(login) => {
            tracing::debug!(%peer, suite = login.suite.bits(), version = ?login.client_version, "login");
            Some((login, ctl))
        }
        Err(e) => {
            let text = match e {
                ProtocolError::InvalidLogin(text) => text,
                _ => "Invalid login message.",
            };
            tracing::info!(%peer, reason = text, "login rejected");
            let _ = ctl.send_error(text).await;
            None
        }
    }
}

/// Heartbeat a queued client. It must answer with `MSG_WAITING` within `wait`.
pub async fn probe_client<S>(ctl: &mut ControlChannel<S>, wait: Duration) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    if tokio::time::timeout(wait, ctl.send_queue(QueueStatus::Heartbeat))
        .await
        .map_or(true, |r| r.is_err())
    {
        return false;
    }
    ctl.recv_expect(MessageType::Waiting, wait).await.is_ok()
}
