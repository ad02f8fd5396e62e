use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use zonehvac_common::{
    peripheral_state_topic, Address, Link, PeripheralNode, RuntimeConfig, UdpRadio,
};

use crate::sim::{Drift, PeripheralState, Settings};

/// Pause between join attempts while no controller answers.
const JOIN_RETRY: Duration = Duration::from_secs(1);

type Node = PeripheralNode<UdpRadio, Arc<AtomicBool>>;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env()?;
    let mut runtime = load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    if let Some(port) = std::env::var("RADIO_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.radio.port = port;
    }

    let radio = UdpRadio::open(&runtime.radio).with_context(|| {
        format!(
            "failed to open radio on {}:{}",
            runtime.radio.group, runtime.radio.port
        )
    })?;
    let nonce = rand::thread_rng().gen_range(1..=i32::MAX);
    let sync = Arc::new(AtomicBool::new(settings.sync_held));
    let link = Link::new(radio, Address::BROADCAST, &runtime.protocol);
    let node = PeripheralNode::new(link, settings.role, sync.clone(), nonce, &runtime.protocol);
    info!(
        "simulated {} started (nonce {nonce:#010x})",
        settings.role.kind()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (state_tx, state_rx) = watch::channel(None);
    let worker = spawn_node_loop(node, sync, settings.drift, stop.clone(), state_tx)?;

    if let Some(mqtt) = connect_mqtt() {
        spawn_state_publish_loop(mqtt, state_rx);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    stop.store(true, Ordering::Relaxed);
    tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("node thread join failed")?
        .map_err(|_| anyhow::anyhow!("node thread panicked"))?;
    Ok(())
}

fn spawn_node_loop(
    mut node: Node,
    sync: Arc<AtomicBool>,
    drift: Option<Drift>,
    stop: Arc<AtomicBool>,
    state: watch::Sender<Option<PeripheralState>>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("peripheral-node".into())
        .spawn(move || {
            let mut last_drift = Instant::now();
            while !stop.load(Ordering::Relaxed) {
                if node.enrollment().is_none() {
                    if !sync.load(Ordering::Relaxed) {
                        thread::sleep(JOIN_RETRY);
                        continue;
                    }
                    if let Err(err) = node.join() {
                        debug!("no controller yet: {err}");
                        thread::sleep(JOIN_RETRY);
                        continue;
                    }
                }

                node.run_once();

                if let Some(drift) = drift {
                    if last_drift.elapsed() >= drift.period {
                        drift.apply(node.role_mut());
                        last_drift = Instant::now();
                    }
                }

                let next = node
                    .enrollment()
                    .map(|enrollment| PeripheralState::new(enrollment.address, node.role()));
                state.send_if_modified(|current| {
                    if *current == next {
                        return false;
                    }
                    *current = next;
                    true
                });
            }
        })
        .context("failed to spawn peripheral node thread")
}

fn connect_mqtt() -> Option<AsyncClient> {
    let host = std::env::var("MQTT_HOST").ok().filter(|host| !host.is_empty())?;
    let port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let client_id = format!("zonehvac-peripheral-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, host, port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(options, 32);
    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("peripheral mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });
    Some(mqtt)
}

fn spawn_state_publish_loop(mqtt: AsyncClient, state: watch::Receiver<Option<PeripheralState>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            let current = state.borrow().clone();
            let Some(current) = current else {
                continue;
            };
            let body = match serde_json::to_vec(&current) {
                Ok(body) => body,
                Err(err) => {
                    warn!("peripheral state serialization failed: {err}");
                    continue;
                }
            };
            if let Err(err) = mqtt
                .publish(
                    peripheral_state_topic(current.address),
                    QoS::AtLeastOnce,
                    true,
                    body,
                )
                .await
            {
                warn!("peripheral state publish failed: {err}");
            }
        }
    });
}

/// Same `runtime.json` as the controller so both ends agree on radio settings.
async fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let path = std::env::var("ZONEHVAC_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.zonehvac"))
        .join("runtime.json");
    match tokio::fs::read(&path).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}
