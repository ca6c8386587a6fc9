use std::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    timer::{EspTaskTimerService, EspTimer},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use pump_common::{
    config::NetworkConfig, Command, ControllerConfig, Interval, PersistedRecord, PumpAction,
    PumpEngine, TickFlag,
};

const NVS_NAMESPACE: &str = "pump";
const NVS_RECORD_KEY: &str = "status";
const NVS_CONFIG_KEY: &str = "config_json";
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const LOOP_YIELD_MS: u64 = 20;

enum Inbound {
    Connected,
    Command(Command),
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct Relay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    gpio: i32,
}

struct Ticker {
    timer: EspTimer<'static>,
}

struct ActionExecutor {
    mqtt: EspMqttClient<'static>,
    store: NvsStore,
    relay: Relay,
    ticker: Ticker,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    info!("turning on");

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = store.load_config().unwrap_or_else(|err| {
        warn!("failed to load controller config from NVS: {err:#}");
        ControllerConfig::default()
    });
    ensure_wifi_defaults(&mut config.network);
    config.sanitize();

    let record = match store.load_record() {
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

    let Peripherals { modem, .. } = Peripherals::take()?;
    let relay = Relay::new(config.relay_pin)?;

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &config.network) {
        Ok(wifi) => wifi,
        Err(err) => {
            warn!("wifi startup failed ({err:#}); restarting");
            restart_device();
        }
    };

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let tick_flag = Arc::new(TickFlag::new());
    let timer_service = EspTaskTimerService::new()?;
    let ticker = Ticker::new(&timer_service, tick_flag.clone())?;

    let (mqtt, mqtt_conn) = create_mqtt_client(&config.network)?;
    let (inbound_tx, inbound_rx) = mpsc::channel();
    spawn_mqtt_receiver(mqtt_conn, inbound_tx);

    let mut executor = ActionExecutor {
        mqtt,
        store,
        relay,
        ticker,
    };
    executor.execute(engine.boot());
    info!("control loop started: {}", engine.record());

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    control_loop(&mut engine, &mut executor, &inbound_rx, &tick_flag)
}

fn control_loop(
    engine: &mut PumpEngine,
    executor: &mut ActionExecutor,
    inbound: &Receiver<Inbound>,
    tick_flag: &TickFlag,
) -> ! {
    loop {
        for event in inbound.try_iter() {
            let actions = match event {
                Inbound::Connected => engine.on_connected(),
                Inbound::Command(command) => engine.handle(command),
            };
            executor.execute(actions);
        }

        if tick_flag.take() {
            info!("tick occurred");
            let actions = engine.tick();
            executor.execute(actions);
        }

        thread::sleep(Duration::from_millis(LOOP_YIELD_MS));
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(wifi);
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    Err(anyhow!(
        "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {last_err:?}"
    ))
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);
    info!("connecting to mqtt broker {url} as `{}`", network.mqtt_client_id);

    let conf = MqttClientConfiguration {
        client_id: Some(network.mqtt_client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

/// Decodes inbound messages and forwards them; the client reconnects on its
/// own and reports each new session as `Connected`.
fn spawn_mqtt_receiver(mut conn: EspMqttConnection, inbound: Sender<Inbound>) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let forwarded = match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        Some(Inbound::Connected)
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        None
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => decode_message(topic, data).map(Inbound::Command),
                    _ => None,
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    None
                }
            };

            if let Some(inbound_event) = forwarded {
                if inbound.send(inbound_event).is_err() {
                    break;
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver thread ({err}); restarting");
        restart_device();
    }
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
    fn execute(&mut self, actions: Vec<PumpAction>) {
        for action in actions {
            match action {
                PumpAction::SetRelay(on) => self.relay.set(on),
                PumpAction::Publish { topic, payload } => {
                    if let Err(err) =
                        self.mqtt
                            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes())
                    {
                        warn!("publish on {topic} failed: {err:?}");
                    }
                }
                PumpAction::Subscribe(topic) => {
                    if let Err(err) = self.mqtt.subscribe(topic, QoS::AtMostOnce) {
                        warn!("subscribe to {topic} failed: {err:?}");
                    }
                }
                PumpAction::Persist(record) => {
                    if let Err(err) = self.store.save_record(&record) {
                        warn!("failed to persist {record}: {err:#}");
                    }
                }
                PumpAction::ArmTicker(interval) => self.ticker.arm(interval),
                PumpAction::Restart => restart_device(),
            }
        }
    }
}

impl Relay {
    fn new(gpio: i32) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::output(AnyOutputPin::new(gpio)) }
            .with_context(|| format!("relay output unavailable on GPIO{gpio}"))?;
        pin.set_low()?;
        Ok(Self { pin, gpio })
    }

    fn set(&mut self, on: bool) {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };

        if let Err(err) = result {
            warn!("failed to drive relay on GPIO{}: {err}", self.gpio);
        }
    }
}

impl Ticker {
    fn new(service: &EspTaskTimerService, flag: Arc<TickFlag>) -> anyhow::Result<Self> {
        // Runs in the esp_timer task; only the flag is touched here.
        let timer = service.timer(move || flag.raise())?;
        Ok(Self { timer })
    }

    fn arm(&mut self, interval: Interval) {
        match self.timer.every(interval.as_duration()) {
            Ok(()) => info!("ticker armed every {}ms", interval.as_millis()),
            Err(err) => warn!("failed to arm ticker: {err:?}"),
        }
    }
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<ControllerConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 1024];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<ControllerConfig>(value)?),
            None => Ok(ControllerConfig::default()),
        }
    }

    /// `None` when no record exists (a default one is written) or when the
    /// stored content does not parse.
    fn load_record(&self) -> anyhow::Result<Option<PersistedRecord>> {
        let stored = {
            let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
            let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
            let mut buffer = [0_u8; 64];
            nvs.get_str(NVS_RECORD_KEY, &mut buffer)?.map(str::to_string)
        };

        let Some(raw) = stored else {
            info!("no stored record yet; creating it");
            if let Err(err) = self.save_record(&PersistedRecord::default()) {
                warn!("failed to create default record: {err:#}");
            }
            return Ok(None);
        };

        match PersistedRecord::parse(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!("stored record is unreadable ({err}); keeping defaults");
                Ok(None)
            }
        }
    }

    fn save_record(&self, record: &PersistedRecord) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_str(NVS_RECORD_KEY, &record.encode())?;
        Ok(())
    }
}

fn restart_device() -> ! {
    warn!("restarting device");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
    #[allow(unreachable_code)]
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
