use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info, warn};

use zonehvac_common::{
    Address, ControllerStatus, DeviceKind, Held, HvacMode, JoinError, Link, PauseToken, RoomId,
    RuntimeConfig, SystemClock, TopologyError, UdpRadio, TOPIC_CONTROLLER_ROOMS,
    TOPIC_CONTROLLER_STATE,
};

use crate::{
    relays::LoggingRelays,
    service::{Controller, ServiceError},
};

type Core = Controller<UdpRadio, SystemClock, LoggingRelays>;

/// How long a structural edit waits for a running cycle before giving up.
const EXCLUSIVE_WAIT: Duration = Duration::from_secs(5);
const TICK_WAIT: Duration = Duration::from_millis(250);

#[derive(Clone)]
struct AppState {
    core: Arc<Mutex<Core>>,
    pause: PauseToken,
    sync: Arc<AtomicBool>,
    status: Arc<watch::Sender<ControllerStatus>>,
    mqtt: Option<AsyncClient>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct ClockUpdate {
    hour: u32,
    minute: u32,
}

#[derive(Debug, Serialize)]
struct ClockView {
    #[serde(rename = "wallClock")]
    wall_clock: String,
}

#[derive(Debug, Serialize)]
struct FlowView {
    address: Address,
    #[serde(rename = "flowPercent")]
    flow_percent: i32,
}

#[derive(Debug, Serialize)]
struct RemovedView {
    address: Address,
    #[serde(rename = "roomCount")]
    room_count: usize,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let radio = UdpRadio::open(&runtime.radio).with_context(|| {
        format!(
            "failed to open radio on {}:{}",
            runtime.radio.group, runtime.radio.port
        )
    })?;
    let timezone: Tz = runtime
        .timezone
        .parse()
        .unwrap_or(chrono_tz::America::Los_Angeles);
    let link = Link::new(radio, Address::BROADCAST, &runtime.protocol);
    let core = Controller::new(
        link,
        SystemClock::new(timezone),
        LoggingRelays::default(),
        &runtime,
    );
    let (status, _) = watch::channel(core.status(false, false));

    let mqtt = match std::env::var("MQTT_HOST").ok().or(runtime.mqtt.host.clone()) {
        Some(host) if !host.is_empty() => {
            let port = std::env::var("MQTT_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(runtime.mqtt.port);
            let mut options = MqttOptions::new("zonehvac-controller", host, port);
            let user = std::env::var("MQTT_USER").unwrap_or(runtime.mqtt.user.clone());
            let pass = std::env::var("MQTT_PASS").unwrap_or(runtime.mqtt.pass.clone());
            if !user.is_empty() {
                options.set_credentials(user, pass);
            }
            let (client, eventloop) = AsyncClient::new(options, 64);
            spawn_mqtt_loop(eventloop);
            Some(client)
        }
        _ => {
            info!("no mqtt broker configured, status publishing disabled");
            None
        }
    };

    let app_state = AppState {
        core: Arc::new(Mutex::new(core)),
        pause: PauseToken::new(),
        sync: Arc::new(AtomicBool::new(false)),
        status: Arc::new(status),
        mqtt,
        store,
    };

    spawn_control_loop(
        app_state.clone(),
        Duration::from_millis(runtime.control.cycle_interval_ms),
    )?;
    if app_state.mqtt.is_some() {
        spawn_state_publish_loop(app_state.clone());
    }

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/rooms", get(handle_get_rooms))
        .route("/api/sync/start", post(handle_sync_start))
        .route("/api/sync/stop", post(handle_sync_stop))
        .route("/api/join/thermostat", post(handle_join_thermostat))
        .route("/api/rooms/{room}/registers", post(handle_add_register))
        .route("/api/devices/{address}", delete(handle_remove_device))
        .route("/api/mode", post(handle_set_mode))
        .route("/api/pause", post(handle_pause))
        .route("/api/resume", post(handle_resume))
        .route("/api/clock", put(handle_put_clock))
        .route("/api/registers/{address}/flow", get(handle_get_register_flow))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_mqtt_loop(mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// The radio and relays block, so cycles run on their own thread rather than
/// on the runtime.
fn spawn_control_loop(app_state: AppState, interval: Duration) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .spawn(move || loop {
            match app_state.pause.begin_tick(TICK_WAIT) {
                Some(_tick) => {
                    let mut core = lock_core(&app_state.core);
                    let report = core.tick();
                    debug!(
                        "cycle: {} valid rooms, {} actions, {} register failures",
                        report.valid_rooms,
                        report.actions.len(),
                        report.register_failures
                    );
                    refresh_status(&app_state, &core);
                }
                None => debug!("control cycle held"),
            }
            thread::sleep(interval);
        })
        .context("failed to spawn control loop")?;
    Ok(())
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let Some(mqtt) = app_state.mqtt.clone() else {
            return;
        };
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            let status = app_state.status.borrow().clone();
            match serde_json::to_vec(&status) {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }

            match serde_json::to_vec(&status.rooms) {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(TOPIC_CONTROLLER_ROOMS, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("room list publish failed: {err}");
                    }
                }
                Err(err) => warn!("room list serialization failed: {err}"),
            }
        }
    });
}

fn lock_core(core: &Mutex<Core>) -> MutexGuard<'_, Core> {
    core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn refresh_status(state: &AppState, core: &Core) {
    state.status.send_replace(core.status(
        state.pause.is_held(),
        state.sync.load(Ordering::Relaxed),
    ));
}

/// Runs `work` on a blocking thread with cycles held off. `None` means a
/// running cycle did not finish in time.
async fn with_exclusive<T, F>(state: &AppState, work: F) -> Result<T, axum::response::Response>
where
    F: FnOnce(&mut Core) -> T + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let _exclusive = state.pause.exclusive(EXCLUSIVE_WAIT)?;
        let mut core = lock_core(&state.core);
        let value = work(&mut core);
        refresh_status(&state, &core);
        Some(value)
    })
    .await;

    match outcome {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Control cycle still running, try again",
        )),
        Err(err) => {
            warn!("controller task failed: {err}");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Controller task failed",
            ))
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.borrow().clone())
}

async fn handle_get_rooms(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.borrow().rooms.clone())
}

async fn handle_sync_start(State(state): State<AppState>) -> impl IntoResponse {
    if state.sync.swap(true, Ordering::SeqCst) {
        return error_response(StatusCode::CONFLICT, "Sync session already running");
    }
    state.status.send_modify(|status| status.sync_active = true);

    let session = state.clone();
    tokio::spawn(async move {
        let sync = session.sync.clone();
        let result = with_exclusive(&session, move |core| core.run_sync_session(&*sync)).await;
        session.sync.store(false, Ordering::SeqCst);
        session.status.send_modify(|status| status.sync_active = false);
        match result {
            Ok(report) => info!(
                "sync session at {} admitted {} devices",
                report.local,
                report.joined.len()
            ),
            Err(_) => warn!("sync session could not start"),
        }
    });

    (StatusCode::ACCEPTED, Json(state.status.borrow().clone())).into_response()
}

async fn handle_sync_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.sync.store(false, Ordering::SeqCst);
    state.status.send_modify(|status| status.sync_active = false);
    Json(state.status.borrow().clone()).into_response()
}

async fn handle_join_thermostat(State(state): State<AppState>) -> impl IntoResponse {
    let result = with_exclusive(&state, |core| {
        core.join_one_device(DeviceKind::Thermostat, &Held)
    })
    .await;
    match result {
        Ok(Ok(joined)) => (StatusCode::CREATED, Json(joined)).into_response(),
        Ok(Err(err)) => service_error_response(&err),
        Err(response) => response,
    }
}

async fn handle_add_register(
    State(state): State<AppState>,
    Path(room): Path<usize>,
) -> impl IntoResponse {
    if room == 0 {
        return error_response(StatusCode::BAD_REQUEST, "Rooms are numbered from 1");
    }
    let result = with_exclusive(&state, move |core| {
        core.add_register_to_room(RoomId(room), &Held)
    })
    .await;
    match result {
        Ok(Ok(joined)) => (StatusCode::CREATED, Json(joined)).into_response(),
        Ok(Err(err)) => service_error_response(&err),
        Err(response) => response,
    }
}

async fn handle_remove_device(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let Some(address) = parse_address(&address) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid device address");
    };
    let result = with_exclusive(&state, move |core| {
        core.remove_device(address)
            .map(|_| core.topology().room_count())
    })
    .await;
    match result {
        Ok(Ok(room_count)) => Json(RemovedView {
            address,
            room_count,
        })
        .into_response(),
        Ok(Err(err)) => service_error_response(&err),
        Err(response) => response,
    }
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = HvacMode::parse(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid mode. Use 'AUTO', 'COOL', 'HEAT' or 'FAN'",
        );
    };

    let changed = match with_exclusive(&state, move |core| core.set_mode(mode)).await {
        Ok(changed) => changed,
        Err(response) => return response,
    };

    if changed {
        if let Err(err) = persist_mode(&state, mode).await {
            warn!("failed to persist mode update: {err:#}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist runtime settings",
            );
        }
    }

    Json(state.status.borrow().clone()).into_response()
}

async fn handle_pause(State(state): State<AppState>) -> impl IntoResponse {
    state.pause.pause();
    state.status.send_modify(|status| status.paused = true);
    info!("control cycles held by user");
    Json(state.status.borrow().clone())
}

async fn handle_resume(State(state): State<AppState>) -> impl IntoResponse {
    state.pause.resume();
    state.status.send_modify(|status| status.paused = false);
    info!("control cycles resumed");
    Json(state.status.borrow().clone())
}

async fn handle_put_clock(
    State(state): State<AppState>,
    Json(update): Json<ClockUpdate>,
) -> impl IntoResponse {
    let result = with_exclusive(&state, move |core| {
        core.set_wall_clock(update.hour, update.minute)
    })
    .await;
    match result {
        Ok(Ok(wall_clock)) => Json(ClockView {
            wall_clock: wall_clock.to_string(),
        })
        .into_response(),
        Ok(Err(err)) => service_error_response(&err),
        Err(response) => response,
    }
}

async fn handle_get_register_flow(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let Some(address) = parse_address(&address) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid device address");
    };
    let result = with_exclusive(&state, move |core| core.read_register_flow(address)).await;
    match result {
        Ok(Ok(flow_percent)) => Json(FlowView {
            address,
            flow_percent,
        })
        .into_response(),
        Ok(Err(err)) => service_error_response(&err),
        Err(response) => response,
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("ZONEHVAC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.zonehvac"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

async fn persist_mode(state: &AppState, mode: HvacMode) -> anyhow::Result<()> {
    let mut runtime = state.store.load_runtime_config().await?;
    runtime.mode = mode;
    state.store.save_runtime_config(&runtime).await
}

/// Accepts `0x81`-style hex or plain decimal.
fn parse_address(value: &str) -> Option<Address> {
    let raw = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16).ok()?,
        None => value.parse::<u8>().ok()?,
    };
    let address = Address(raw);
    (!address.is_reserved()).then_some(address)
}

fn service_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::InvalidTime(..) => StatusCode::BAD_REQUEST,
        ServiceError::Topology(TopologyError::UnknownAddress(_))
        | ServiceError::Topology(TopologyError::UnknownRoom(_))
        | ServiceError::Join(JoinError::Topology(TopologyError::UnknownRoom(_))) => {
            StatusCode::NOT_FOUND
        }
        ServiceError::Topology(_)
        | ServiceError::Join(JoinError::Topology(_))
        | ServiceError::Join(JoinError::NoRoom)
        | ServiceError::Join(JoinError::DeviceLimit(_))
        | ServiceError::Join(JoinError::Rejected) => StatusCode::CONFLICT,
        ServiceError::Join(JoinError::Timeout)
        | ServiceError::Join(JoinError::NotConfirmed)
        | ServiceError::Join(JoinError::SyncReleased) => StatusCode::GATEWAY_TIMEOUT,
        ServiceError::Link(_) | ServiceError::Join(JoinError::Link(_)) => StatusCode::BAD_GATEWAY,
    }
}

fn service_error_response(err: &ServiceError) -> axum::response::Response {
    error_response(service_status(err), &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use zonehvac_common::LinkError;

    #[test]
    fn addresses_parse_as_hex_or_decimal() {
        assert_eq!(parse_address("0x81"), Some(Address(0x81)));
        assert_eq!(parse_address("0X05"), Some(Address(0x05)));
        assert_eq!(parse_address("129"), Some(Address(0x81)));
        assert_eq!(parse_address("0x00"), None);
        assert_eq!(parse_address("255"), None);
        assert_eq!(parse_address("0x1ff"), None);
        assert_eq!(parse_address("room"), None);
    }

    #[test]
    fn service_errors_map_to_http_statuses() {
        let missing = ServiceError::Topology(TopologyError::UnknownAddress(Address(0x81)));
        let no_room = ServiceError::Join(JoinError::NoRoom);
        let silent = ServiceError::Join(JoinError::Timeout);
        let lost = ServiceError::Link(LinkError::ReplyTimeout(Address(0x03), 10));

        assert_eq!(service_status(&missing), StatusCode::NOT_FOUND);
        assert_eq!(service_status(&no_room), StatusCode::CONFLICT);
        assert_eq!(service_status(&silent), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(service_status(&lost), StatusCode::BAD_GATEWAY);
        assert_eq!(
            service_status(&ServiceError::InvalidTime(25, 0)),
            StatusCode::BAD_REQUEST
        );
    }
}
