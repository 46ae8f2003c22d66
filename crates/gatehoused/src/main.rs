//! gatehoused - The gatehouse background service
//!
//! This is the main entry point for the gatehoused service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Core engine
//! - Expiry wake-up scheduler
//! - IPC server

use anyhow::{Context, Result};
use clap::Parser;
use gatehouse_api::{
    ClientRole, Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus, Response,
    ResponsePayload, SessionRequest, StartDenied, StartedSession,
};
use gatehouse_config::{load_config, load_config_or_default};
use gatehouse_core::{AccessOutcome, CoreEngine, CoreError, CoreEvent};
use gatehouse_host_api::{TokioScheduler, WakeEvent, WakeScheduler};
use gatehouse_ipc::{IpcServer, ServerMessage};
use gatehouse_store::{AuditEvent, AuditEventType, SqliteStore, StateChange, Store};
use gatehouse_util::{
    canonicalize_target, data_dir_without_env, database_path, default_config_path,
    socket_path_without_env, ClientId, RateLimiter,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Requests allowed per client per second
const RATE_LIMIT_PER_SECOND: u32 = 30;

/// gatehoused - Session and cooldown gatekeeping for distracting sites
#[derive(Parser, Debug)]
#[command(name = "gatehoused")]
#[command(about = "Session and cooldown gatekeeping for distracting sites", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/gatehouse/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set GATEHOUSE_SOCKET env var)
    #[arg(short, long, env = "GATEHOUSE_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set GATEHOUSE_DATA_DIR env var)
    #[arg(short, long, env = "GATEHOUSE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Main service state
struct Service {
    engine: Arc<CoreEngine>,
    scheduler: Arc<TokioScheduler>,
    ipc: Arc<IpcServer>,
    store: Arc<dyn Store>,
    rate_limiter: RateLimiter,
    config_path: PathBuf,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let policy = load_config_or_default(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        info!(
            config_path = %args.config.display(),
            monitored_sites = policy.sites.len(),
            "Configuration loaded"
        );

        let socket_path = args
            .socket
            .clone()
            .or_else(|| policy.service.socket_path.clone())
            .unwrap_or_else(socket_path_without_env);

        let data_dir = args
            .data_dir
            .clone()
            .or_else(|| policy.service.data_dir.clone())
            .unwrap_or_else(data_dir_without_env);

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = database_path(&data_dir);
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );

        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        let scheduler = Arc::new(TokioScheduler::new());
        let engine = Arc::new(CoreEngine::new(policy, store.clone(), scheduler.clone()));

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start().await?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            engine,
            scheduler,
            ipc: Arc::new(ipc),
            store,
            rate_limiter: RateLimiter::new(RATE_LIMIT_PER_SECOND, Duration::from_secs(1)),
            config_path: args.config.clone(),
        })
    }

    async fn run(mut self) -> Result<()> {
        let mut wake_events = self
            .scheduler
            .subscribe()
            .context("Failed to subscribe to wake-ups")?;
        let mut changes = self.store.subscribe();
        let mut ipc_messages = self
            .ipc
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        // Duration sessions persisted by a previous run
        match self.engine.reschedule_pending(gatehouse_util::now()) {
            Ok(events) => {
                for event in events {
                    self.handle_core_event(event);
                }
            }
            Err(e) => error!(error = %e, "Failed to reschedule pending sessions"),
        }

        let ipc_accept = self.ipc.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;

        let mut cleanup_timer = tokio::time::interval(Duration::from_secs(60));

        if gatehouse_util::is_mock_time_active() {
            warn!(now = %gatehouse_util::now(), "Mock time is active");
        }
        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down gracefully");
                    break;
                }

                _ = cleanup_timer.tick() => {
                    self.rate_limiter.cleanup(Duration::from_secs(60));
                }

                Some(wake) = wake_events.recv() => {
                    self.handle_wake(wake);
                }

                change = changes.recv() => {
                    match change {
                        Ok(change) => self.handle_state_change(change),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Change feed lagged, some StateChanged events were dropped");
                        }
                        Err(RecvError::Closed) => {
                            error!("Change feed closed");
                            break;
                        }
                    }
                }

                Some(msg) = ipc_messages.recv() => {
                    self.handle_ipc_message(msg).await;
                }
            }
        }

        info!("Shutting down gatehoused");

        self.ipc.broadcast_event(Event::new(EventPayload::Shutdown));
        // Give writers a moment to flush the shutdown event
        tokio::time::sleep(Duration::from_millis(50)).await;

        if let Err(e) = self
            .store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStopped))
        {
            warn!(error = %e, "Failed to log service shutdown");
        }

        self.ipc.shutdown();
        info!("Shutdown complete");
        Ok(())
    }

    fn handle_wake(&self, wake: WakeEvent) {
        let now = gatehouse_util::now();
        debug!(key = %wake.key, at = %wake.at, "Wake-up fired");

        match self.engine.handle_wake(&wake.key, wake.at, now) {
            Ok(Some(event)) => self.handle_core_event(event),
            Ok(None) => {}
            Err(e) => {
                // Leave the session in place; the next access attempt expires it
                error!(key = %wake.key, error = %e, "Failed to expire session on wake-up");
            }
        }
    }

    fn handle_state_change(&self, change: StateChange) {
        debug!(key = %change.key, "Broadcasting StateChanged");
        self.ipc.broadcast_event(Event::new(EventPayload::StateChanged {
            key: change.key,
            before: change.before,
            after: change.after,
        }));
    }

    fn handle_core_event(&self, event: CoreEvent) {
        match event {
            CoreEvent::SessionExpired {
                key,
                cooldown_ends_at,
            } => {
                info!(key = %key, cooldown_ends_at = %cooldown_ends_at, "Session expired, surfaces must re-check");
                self.ipc.broadcast_event(Event::new(EventPayload::SessionExpired {
                    key,
                    cooldown_ends_at,
                }));
            }

            CoreEvent::PolicyReloaded { monitored_sites } => {
                self.ipc
                    .broadcast_event(Event::new(EventPayload::PolicyReloaded { monitored_sites }));
            }
        }
    }

    async fn handle_ipc_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Request { client_id, request } => {
                if !self.rate_limiter.check(&client_id) {
                    let response = Response::error(
                        request.request_id,
                        ErrorInfo::new(ErrorCode::RateLimited, "Too many requests"),
                    );
                    let _ = self.ipc.send_response(&client_id, response).await;
                    return;
                }

                let response = self
                    .handle_command(&client_id, request.request_id, request.command)
                    .await;

                let _ = self.ipc.send_response(&client_id, response).await;
            }

            ServerMessage::ClientConnected { client_id, info } => {
                info!(
                    client_id = %client_id,
                    role = ?info.role,
                    uid = ?info.uid,
                    "Client connected"
                );

                let _ = self.store.append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                    client_id: client_id.to_string(),
                    role: format!("{:?}", info.role),
                    uid: info.uid,
                }));
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");

                let _ = self.store.append_audit(AuditEvent::new(
                    AuditEventType::ClientDisconnected {
                        client_id: client_id.to_string(),
                    },
                ));

                self.rate_limiter.remove_client(&client_id);
            }
        }
    }

    async fn handle_command(
        &self,
        client_id: &ClientId,
        request_id: u64,
        command: Command,
    ) -> Response {
        let now = gatehouse_util::now();
        let role = self
            .ipc
            .get_client_info(client_id)
            .await
            .map(|info| info.role)
            .unwrap_or(ClientRole::Observer);

        let negotiates = matches!(
            command,
            Command::CheckAccess { .. }
                | Command::StartSession { .. }
                | Command::Heartbeat { .. }
                | Command::Bypass { .. }
        );
        if negotiates && !role.can_negotiate() {
            return Response::error(
                request_id,
                ErrorInfo::new(ErrorCode::PermissionDenied, "Observers cannot change session state"),
            );
        }

        match command {
            Command::CheckAccess { target } => match self.engine.on_access_attempt(&target, now) {
                Ok(AccessOutcome::NotMonitored) => {
                    Response::success(request_id, ResponsePayload::NotMonitored)
                }
                Ok(AccessOutcome::Decided { key, decision }) => {
                    Response::success(request_id, ResponsePayload::Access { key, decision })
                }
                Err(e) => core_error_response(request_id, e),
            },

            Command::StartSession { target, request } => {
                let result = self.engine.start_session(&target, request, now);
                self.start_response(request_id, request, result, now)
            }

            Command::Bypass { target } => {
                let result = self.engine.bypass(&target, now);
                self.start_response(request_id, SessionRequest::Unlimited, result, now)
            }

            Command::Heartbeat { target } => match self.engine.heartbeat(&target, now) {
                Ok(alive) => {
                    if !alive {
                        debug!(target = %target, "Heartbeat without a live unlimited session");
                    }
                    Response::success(request_id, ResponsePayload::HeartbeatAccepted)
                }
                Err(e) => core_error_response(request_id, e),
            },

            Command::GetKeyStatus { target } => {
                let key = match canonicalize_target(&target) {
                    Ok(key) => key,
                    Err(e) => {
                        return Response::error(
                            request_id,
                            ErrorInfo::new(ErrorCode::InvalidRequest, e.to_string()),
                        );
                    }
                };
                match self.engine.key_status(&key, now) {
                    Ok(status) => Response::success(request_id, ResponsePayload::KeyStatus(status)),
                    Err(e) => core_error_response(request_id, e),
                }
            }

            Command::GetQuota => match self.engine.quota_status(now) {
                Ok(status) => Response::success(request_id, ResponsePayload::Quota(status)),
                Err(e) => core_error_response(request_id, e),
            },

            Command::ReloadConfig => {
                if !role.can_reload_config() {
                    return Response::error(
                        request_id,
                        ErrorInfo::new(ErrorCode::PermissionDenied, "Admin role required"),
                    );
                }

                match load_config(&self.config_path) {
                    Ok(policy) => {
                        let monitored_sites = policy.sites.len();
                        let event = self.engine.reload_policy(policy);
                        self.audit(AuditEventType::ConfigReloaded { success: true });
                        self.handle_core_event(event);
                        Response::success(
                            request_id,
                            ResponsePayload::ConfigReloaded { monitored_sites },
                        )
                    }
                    Err(e) => {
                        warn!(path = %self.config_path.display(), error = %e, "Config reload failed, keeping current policy");
                        self.audit(AuditEventType::ConfigReloaded { success: false });
                        Response::error(
                            request_id,
                            ErrorInfo::new(ErrorCode::ConfigError, e.to_string()),
                        )
                    }
                }
            }

            Command::SubscribeEvents => Response::success(
                request_id,
                ResponsePayload::Subscribed {
                    client_id: client_id.clone(),
                },
            ),

            Command::UnsubscribeEvents => {
                Response::success(request_id, ResponsePayload::Unsubscribed)
            }

            Command::GetHealth => {
                let store_ok = self.store.is_healthy();
                let health = HealthStatus {
                    live: true,
                    ready: store_ok,
                    store_ok,
                    monitored_sites: self.engine.policy().sites.len(),
                };
                Response::success(request_id, ResponsePayload::Health(health))
            }

            Command::Ping => Response::success(request_id, ResponsePayload::Pong),
        }
    }

    fn start_response(
        &self,
        request_id: u64,
        request: SessionRequest,
        result: Result<Result<StartedSession, StartDenied>, CoreError>,
        now: chrono::DateTime<chrono::Local>,
    ) -> Response {
        match result {
            Ok(Ok(started)) => {
                if request == SessionRequest::Unlimited {
                    match self.engine.quota_status(now) {
                        Ok(status) => self
                            .ipc
                            .broadcast_event(Event::new(EventPayload::QuotaChanged(status))),
                        Err(e) => warn!(error = %e, "Failed to read quota after spending"),
                    }
                }
                Response::success(request_id, ResponsePayload::SessionStarted(started))
            }
            Ok(Err(reason)) => {
                Response::success(request_id, ResponsePayload::StartDenied { reason })
            }
            Err(e) => core_error_response(request_id, e),
        }
    }

    fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }
}

/// Map an engine failure onto the wire. Clients deny on any error.
fn core_error_response(request_id: u64, error: CoreError) -> Response {
    warn!(request_id, error = %error, "Request failed");
    let code = match error {
        CoreError::Store(_) => ErrorCode::StoreUnavailable,
        CoreError::Contention { .. } | CoreError::QuotaContention { .. } => ErrorCode::Contention,
    };
    Response::error(request_id, ErrorInfo::new(code, error.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "gatehoused starting"
    );

    let service = Service::new(&args).await?;
    service.run().await
}
