use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use pump_common::{
    Command, ControllerConfig, Interval, PersistedRecord, PumpAction, PumpEngine, TickFlag,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const RECORD_FILE_NAME: &str = "status";
const LOOP_YIELD: Duration = Duration::from_millis(20);
const MQTT_RETRY_DELAY: Duration = Duration::from_secs(2);
const RESTART_EXIT_CODE: i32 = 3;

#[derive(Debug)]
enum Inbound {
    Connected,
    Command(Command),
}

struct ActionExecutor {
    mqtt: AsyncClient,
    store: RecordStore,
    relay: Relay,
    ticker: Ticker,
}

struct Relay {
    pin: i32,
    energized: bool,
}

struct Ticker {
    flag: Arc<TickFlag>,
    task: Option<JoinHandle<()>>,
}

struct RecordStore {
    path: PathBuf,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    info!("turning on");

    let config = load_config()?;
    let store = RecordStore::new(&config.data_dir);

    let record = match store.load().await {
        Ok(Some(record)) => {
            info!("loaded stored record: {record}");
            record
        }
        Ok(None) => PersistedRecord::default(),
        Err(err) => {
            warn!("failed to read stored record, using defaults: {err:#}");
            PersistedRecord::default()
        }
    };
    let mut engine =
        PumpEngine::new(record).with_normalized_off_payload(config.normalize_off_payload);

    let network = &config.network;
    let mut mqtt_options = MqttOptions::new(
        network.mqtt_client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    if !network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    info!(
        "connecting to mqtt broker {}:{} as `{}`",
        network.mqtt_host, network.mqtt_port, network.mqtt_client_id
    );

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let (inbound_tx, mut inbound_rx) = mpsc::channel(32);
    spawn_mqtt_loop(eventloop, inbound_tx);

    let tick_flag = Arc::new(TickFlag::new());
    let mut executor = ActionExecutor {
        mqtt,
        store,
        relay: Relay::new(config.relay_pin),
        ticker: Ticker::new(tick_flag.clone()),
    };

    executor.execute(engine.boot()).await;
    info!("control loop started: {}", engine.record());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        serve_pending(&mut engine, &mut executor, &mut inbound_rx, &tick_flag).await?;

        tokio::select! {
            _ = tokio::time::sleep(LOOP_YIELD) => {}
            _ = &mut shutdown => {
                info!("shutdown requested");
                return Ok(());
            }
        }
    }
}

/// One control loop pass: drain inbound events without blocking, then serve
/// at most one pending tick.
async fn serve_pending(
    engine: &mut PumpEngine,
    executor: &mut ActionExecutor,
    inbound: &mut mpsc::Receiver<Inbound>,
    tick_flag: &TickFlag,
) -> anyhow::Result<()> {
    loop {
        let actions = match inbound.try_recv() {
            Ok(Inbound::Connected) => engine.on_connected(),
            Ok(Inbound::Command(command)) => engine.handle(command),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => anyhow::bail!("mqtt session task stopped"),
        };
        executor.execute(actions).await;
    }

    if tick_flag.take() {
        info!("tick occurred");
        let actions = engine.tick();
        executor.execute(actions).await;
    }
    Ok(())
}

fn spawn_mqtt_loop(mut eventloop: EventLoop, inbound: mpsc::Sender<Inbound>) {
    tokio::spawn(async move {
        loop {
            let forwarded = match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    decode_message(&message.topic, &message.payload).map(Inbound::Command)
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    Some(Inbound::Connected)
                }
                Ok(_) => None,
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(MQTT_RETRY_DELAY).await;
                    None
                }
            };

            if let Some(inbound_event) = forwarded {
                if inbound.send(inbound_event).await.is_err() {
                    break;
                }
            }
        }
    });
}

fn decode_message(topic: &str, payload: &[u8]) -> Option<Command> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return None;
    }

    info!(
        "message arrived [{topic}] {}",
        String::from_utf8_lossy(payload)
    );
    match Command::decode(topic, payload) {
        Ok(command) => Some(command),
        Err(err) => {
            debug!("ignoring mqtt message: {err}");
            None
        }
    }
}

impl ActionExecutor {
    async fn execute(&mut self, actions: Vec<PumpAction>) {
        for action in actions {
            match action {
                PumpAction::SetRelay(on) => self.relay.set(on),
                PumpAction::Publish { topic, payload } => {
                    if let Err(err) = self.mqtt.try_publish(topic, QoS::AtMostOnce, false, payload)
                    {
                        warn!("publish on {topic} failed: {err}");
                    }
                }
                PumpAction::Subscribe(topic) => {
                    if let Err(err) = self.mqtt.try_subscribe(topic, QoS::AtMostOnce) {
                        warn!("subscribe to {topic} failed: {err}");
                    }
                }
                PumpAction::Persist(record) => {
                    if let Err(err) = self.store.save(&record).await {
                        warn!("failed to persist {record}: {err:#}");
                    }
                }
                PumpAction::ArmTicker(interval) => self.ticker.arm(interval),
                PumpAction::Restart => restart_process(),
            }
        }
    }
}

impl Relay {
    fn new(pin: i32) -> Self {
        Self {
            pin,
            energized: false,
        }
    }

    // No GPIO on the host; the level is tracked and logged.
    fn set(&mut self, on: bool) {
        let previous = std::mem::replace(&mut self.energized, on);
        info!(
            "relay GPIO{} {} -> {}",
            self.pin,
            level_name(previous),
            level_name(on)
        );
    }
}

fn level_name(on: bool) -> &'static str {
    if on {
        "HIGH"
    } else {
        "LOW"
    }
}

impl Ticker {
    fn new(flag: Arc<TickFlag>) -> Self {
        Self { flag, task: None }
    }

    fn arm(&mut self, interval: Interval) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let flag = self.flag.clone();
        let period = interval.as_duration();
        self.task = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                flag.raise();
            }
        }));
        info!("ticker armed every {}ms", interval.as_millis());
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl RecordStore {
    fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(RECORD_FILE_NAME),
        }
    }

    /// `None` when no record exists (a default one is written) or when the
    /// stored content does not parse.
    async fn load(&self) -> anyhow::Result<Option<PersistedRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    "no stored record at {}; creating it",
                    self.path.display()
                );
                if let Err(err) = self.save(&PersistedRecord::default()).await {
                    warn!("failed to create default record: {err:#}");
                }
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        match PersistedRecord::parse(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(
                    "stored record at {} is unreadable ({err}); keeping defaults",
                    self.path.display()
                );
                Ok(None)
            }
        }
    }

    // Written to a sibling file and renamed so the pair is replaced as a whole.
    async fn save(&self, record: &PersistedRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, record.encode())
            .await
            .with_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

fn load_config() -> anyhow::Result<ControllerConfig> {
    let mut config = match std::env::var("PUMP_CONFIG") {
        Ok(path) => read_config_file(Path::new(&path))?,
        Err(_) => ControllerConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.sanitize();
    Ok(config)
}

fn read_config_file(path: &Path) -> anyhow::Result<ControllerConfig> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("invalid config file {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!("config file {} not found; using defaults", path.display());
            Ok(ControllerConfig::default())
        }
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn apply_env_overrides(config: &mut ControllerConfig, var: impl Fn(&str) -> Option<String>) {
    let network = &mut config.network;
    if let Some(host) = var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = var("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        network.mqtt_port = port;
    }
    if let Some(user) = var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    if let Some(client_id) = var("MQTT_CLIENT_ID") {
        network.mqtt_client_id = client_id;
    }
    if let Some(data_dir) = var("PUMP_DATA_DIR") {
        config.data_dir = data_dir;
    }
}

/// Re-executes the current binary in place; falls back to exiting so a
/// supervisor can restart it.
fn restart_process() -> ! {
    warn!("restart requested");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        match std::env::current_exe() {
            Ok(exe) => {
                let err = std::process::Command::new(exe)
                    .args(std::env::args_os().skip(1))
                    .exec();
                warn!("re-exec failed: {err}");
            }
            Err(err) => warn!("cannot locate current executable: {err}"),
        }
    }

    std::process::exit(RESTART_EXIT_CODE)
}
