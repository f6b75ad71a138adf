//! `Core` — the long-lived shared state threaded through every worker.
//!
//! Mirrors `backend-rust/src/main.rs`'s construction of shared
//! `Arc<RwLock<_>>` state at startup (spec.md §9 "global in-memory caches
//! become fields on a long-lived `Core` value... no module-level mutable
//! state").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::codec::Telegram;
use crate::config::Config;
use crate::cover_engine::{Command as CoverCommand, CoverEngine};
use crate::error::BridgeResult;
use crate::model::{self, Address, CoverPhase, LightState, SensorValue};
use crate::mqtt_bridge::{self, IncomingCommand, MqttBridge};
use crate::opcodes;
use crate::registry::Registry;
use crate::realtime::{Event as RtEvent, RealtimeHub};
use crate::scheduler::{self, CommandKind, ScheduledCommand, SchedulerHandle};
use crate::sensors::{self, SensorReading, Sniffer};
use crate::store::{PersistedDocument, Store};
use crate::transport::Transport;

/// Idle status-poll interval; shortened while any cover is moving (spec §5).
const STATUS_POLL_IDLE: Duration = Duration::from_secs(20);
const STATUS_POLL_MOVING: Duration = Duration::from_secs(2);
const COVER_TICK_INTERVAL: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy)]
enum SensorKind {
    Temperature,
    Humidity,
    Illuminance,
}

pub struct Core {
    pub config: Config,
    pub registry: Arc<RwLock<Registry>>,
    pub store: Arc<Store>,
    pub cover_engine: RwLock<CoverEngine>,
    pub realtime: RealtimeHub,
    pub scheduler: SchedulerHandle,
    pub transport: Arc<Transport>,
    pub mqtt: MqttBridge,
    pub sniffer: RwLock<Sniffer>,
    status_poll_last: RwLock<HashMap<Address, Instant>>,
}

impl Core {
    /// Builds the shared core: binds UDP, loads persisted state, and wires
    /// up the scheduler and MQTT client. Returns the core plus the
    /// channels `main` needs to drive the receive/command loops.
    pub async fn new(config: Config) -> BridgeResult<(Arc<Core>, mpsc::Receiver<(Telegram, SocketAddr)>, mpsc::Receiver<IncomingCommand>)> {
        let mut transport = Transport::new(&config)?;
        transport.bind(config.local_udp_port).await;
        let transport = Arc::new(transport);

        let scheduler = scheduler::spawn(transport.clone());
        let store = Arc::new(Store::new(&config.state_path));
        let doc = store.read_raw().await;

        let registry = Arc::new(RwLock::new(Registry::new()));
        let mut cover_engine = CoverEngine::new(scheduler.clone());
        {
            let mut reg = registry.write().await;
            for light in doc.devices.lights {
                let _ = reg.add_light(light);
            }
            for cover in doc.devices.covers {
                let key = format!("cover/{}", cover.address);
                let position = doc
                    .states
                    .get(&key)
                    .and_then(|v| v.get("position"))
                    .and_then(|p| p.as_u64())
                    .map(|p| p as u8)
                    .unwrap_or(0);
                cover_engine.ensure_cover(cover.clone(), position);
                let _ = reg.add_cover(cover);
            }
            for group in doc.devices.cover_groups {
                reg.add_cover_group(group);
            }
            for contact in doc.devices.dry_contacts {
                let _ = reg.add_dry_contact(contact);
            }
            for sensor in doc.devices.temperatures {
                let _ = reg.add_temperature(sensor);
            }
            for sensor in doc.devices.humidities {
                let _ = reg.add_humidity(sensor);
            }
            for sensor in doc.devices.illuminances {
                let _ = reg.add_illuminance(sensor);
            }
        }

        let (mqtt, mqtt_rx) = mqtt_bridge::spawn(&config, registry.clone(), store.clone());
        let (udp_tx, udp_rx) = mpsc::channel(256);

        let core = Arc::new(Core {
            config,
            registry,
            store,
            cover_engine: RwLock::new(cover_engine),
            realtime: RealtimeHub::new(),
            scheduler,
            transport,
            mqtt,
            sniffer: RwLock::new(Sniffer::new()),
            status_poll_last: RwLock::new(HashMap::new()),
        });

        {
            let core = core.clone();
            tokio::spawn(async move {
                core.transport.run_receive_loop(udp_tx).await;
            });
        }

        Ok((core, udp_rx, mqtt_rx))
    }

    /// Persists the current registry + last-value cache.
    pub async fn flush(&self) {
        let registry = self.registry.read().await;
        let doc = PersistedDocument {
            devices: crate::store::DevicesSection {
                lights: registry.lights.values().cloned().collect(),
                covers: registry.covers.values().cloned().collect(),
                cover_groups: registry.cover_groups.values().cloned().collect(),
                dry_contacts: registry.dry_contacts.values().cloned().collect(),
                temperatures: registry.temperatures.values().cloned().collect(),
                humidities: registry.humidities.values().cloned().collect(),
                illuminances: registry.illuminances.values().cloned().collect(),
            },
            states: self.store.snapshot_states().await,
            ui: Default::default(),
        };
        if let Err(e) = self.store.write(&doc).await {
            warn!("core: flush failed: {e}");
        }
    }

    /// Initial WebSocket snapshot (spec §4.9).
    pub async fn snapshot(&self) -> Value {
        let registry = self.registry.read().await;
        let states = self.store.snapshot_states().await;

        let sensor_entry = |kind_path: &str, device: &model::SensorDevice| {
            let key = format!("{kind_path}/{}/{}", device.address, device.sensor_id);
            let last = states.get(&key).and_then(|v| v.as_f64());
            json!({ "device": device, "last_value": SensorValue::from_option(last) })
        };

        json!({
            "event": "snapshot",
            "lights": registry.lights.values().collect::<Vec<_>>(),
            "covers": registry.covers.values().collect::<Vec<_>>(),
            "cover_groups": registry.cover_groups.values().collect::<Vec<_>>(),
            "dry_contacts": registry.dry_contacts.values().collect::<Vec<_>>(),
            "temperatures": registry.temperatures.values().map(|d| sensor_entry("temp", d)).collect::<Vec<_>>(),
            "humidities": registry.humidities.values().map(|d| sensor_entry("humidity", d)).collect::<Vec<_>>(),
            "illuminances": registry.illuminances.values().map(|d| sensor_entry("illuminance", d)).collect::<Vec<_>>(),
            "states": states,
        })
    }

    /// Looks up the registered `SensorDevice` for `address` and applies its
    /// scale/offset/decimals to `raw` (spec §4.6). Unregistered addresses
    /// pass the raw decoded value through unchanged.
    async fn calibrate(&self, kind: SensorKind, address: Address, raw: f64) -> f64 {
        let registry = self.registry.read().await;
        let device = match kind {
            SensorKind::Temperature => registry.temperatures.get(&address),
            SensorKind::Humidity => registry.humidities.get(&address),
            SensorKind::Illuminance => registry.illuminances.get(&address),
        };
        match device {
            Some(device) => model::apply_calibration(device, raw),
            None => raw,
        }
    }

    /// Parses and dispatches a JSON command sent over the WebSocket
    /// connection — the end-user/admin surface's one write path into the
    /// same command handling MQTT commands use.
    pub async fn handle_ws_command(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else { return };
        let Some(cmd) = value.get("cmd").and_then(|c| c.as_str()) else { return };
        let address = value.get("address").and_then(|a| serde_json::from_value::<Address>(a.clone()).ok());

        match (cmd, address) {
            ("cover_open", Some(address)) => self.handle_cover_command(address, CoverCommand::Open).await,
            ("cover_close", Some(address)) => self.handle_cover_command(address, CoverCommand::Close).await,
            ("cover_stop", Some(address)) => self.handle_cover_command(address, CoverCommand::Stop).await,
            ("cover_set_position", Some(address)) => {
                if let Some(position) = value.get("position").and_then(|p| p.as_u64()) {
                    self.handle_cover_command(address, CoverCommand::SetPosition(position as u8)).await;
                }
            }
            ("light_set", Some(address)) => {
                let on = value.get("on").and_then(|v| v.as_bool()).unwrap_or(false);
                let brightness = value.get("brightness").and_then(|v| v.as_u64()).map(|v| v as u8);
                self.handle_light_command(address, on, brightness).await;
            }
            _ => debug!("core: unrecognized WS command {cmd}"),
        }
    }

    /// Dispatches one parsed MQTT command (spec §4.7's `cmd/*` topics).
    pub async fn handle_mqtt_command(&self, command: IncomingCommand) {
        match command {
            IncomingCommand::Light { address, on, brightness } => {
                self.handle_light_command(address, on, brightness).await;
            }
            IncomingCommand::CoverOpen { address } => self.handle_cover_command(address, CoverCommand::Open).await,
            IncomingCommand::CoverClose { address } => self.handle_cover_command(address, CoverCommand::Close).await,
            IncomingCommand::CoverStop { address } => self.handle_cover_command(address, CoverCommand::Stop).await,
            IncomingCommand::CoverSetPosition { address, position } => {
                self.handle_cover_command(address, CoverCommand::SetPosition(position)).await;
            }
            IncomingCommand::CoverRaw { address, raw } => self.handle_cover_raw(address, &raw).await,
            IncomingCommand::CoverGroupOpen { id } => self.handle_cover_group_command(id, CoverCommand::Open).await,
            IncomingCommand::CoverGroupClose { id } => self.handle_cover_group_command(id, CoverCommand::Close).await,
            IncomingCommand::CoverGroupStop { id } => self.handle_cover_group_command(id, CoverCommand::Stop).await,
            IncomingCommand::CoverGroupSetPosition { id, position } => {
                self.handle_cover_group_command(id, CoverCommand::SetPosition(position)).await;
            }
            IncomingCommand::CoverGroupRaw { id, raw } => self.handle_cover_group_raw(id, &raw).await,
        }
    }

    async fn handle_light_command(&self, address: Address, on: bool, brightness: Option<u8>) {
        let state = LightState { on, brightness: brightness.unwrap_or(if on { 255 } else { 0 }) };
        // `None` means "on with unknown brightness" — let the bus device pick
        // its own full-on level; 0xFF is the sentinel for that on the wire,
        // distinct from the real 0-100 percent range `Some` carries.
        let (wire_byte, coalesce_kind) = match state.send_percent() {
            Some(pct) => (pct, CommandKind::SetPosition(pct)),
            None => (0xFFu8, CommandKind::SetPosition(100)),
        };
        let telegram = Telegram {
            source_address: Address { subnet: 0, device: 0, channel: 0 },
            destination_address: address,
            op_code: opcodes::SINGLE_CHANNEL_CONTROL,
            payload: vec![wire_byte],
        };
        self.scheduler
            .enqueue(ScheduledCommand { address, kind: coalesce_kind, telegram })
            .await;

        self.mqtt.publish_light_state(address, on, brightness).await;
        self.realtime.broadcast(RtEvent::State {
            address,
            value: json!({ "state": if on { "ON" } else { "OFF" }, "brightness": brightness }),
        });
        self.flush().await;
    }

    async fn handle_cover_command(&self, address: Address, command: CoverCommand) {
        let mut engine = self.cover_engine.write().await;
        if let Some(result) = engine.handle_command(address, command, Instant::now()).await {
            drop(engine);
            self.publish_cover_tick(address, result.state).await;
        }
    }

    async fn handle_cover_raw(&self, address: Address, raw: &str) {
        let command = match raw.to_uppercase().as_str() {
            "OPEN" => CoverCommand::Open,
            "CLOSE" => CoverCommand::Close,
            _ => CoverCommand::Stop,
        };
        self.handle_cover_command(address, command).await;
    }

    async fn handle_cover_group_command(&self, id: uuid::Uuid, command: CoverCommand) {
        let members: Vec<Address> = {
            let registry = self.registry.read().await;
            registry.cover_groups.get(&id).map(|g| g.member_addresses.clone()).unwrap_or_default()
        };
        // Fanned out sequentially through the per-cover scheduler — this
        // alone gives natural pacing across members (spec §4.5).
        for address in members {
            self.handle_cover_command(address, command).await;
        }
    }

    async fn handle_cover_group_raw(&self, id: uuid::Uuid, raw: &str) {
        let command = match raw.to_uppercase().as_str() {
            "OPEN" => CoverCommand::Open,
            "CLOSE" => CoverCommand::Close,
            _ => CoverCommand::Stop,
        };
        self.handle_cover_group_command(id, command).await;
    }

    async fn publish_cover_tick(&self, address: Address, state: crate::model::CoverState) {
        let state_str = match state.phase {
            CoverPhase::Idle if state.position == 0 => "closed",
            CoverPhase::Idle if state.position == 100 => "open",
            CoverPhase::Idle => "stopped",
            CoverPhase::Opening => "opening",
            CoverPhase::Closing => "closing",
        };
        self.mqtt.publish_cover_state(address, state_str, state.position).await;
        self.realtime.broadcast(RtEvent::CoverState { address, state });
    }

    /// Dispatches one decoded telegram: cover status, known sensor opcode,
    /// or dry contact, falling through to the sniffer for anything else.
    pub async fn process_telegram(&self, telegram: Telegram) {
        match telegram.op_code {
            opcodes::CURTAIN_SWITCH_STATUS_RESPONSE => {
                let signal_byte = telegram.payload.first().copied().unwrap_or(0);
                let mut engine = self.cover_engine.write().await;
                if let Some(result) = engine.handle_bus_status(telegram.source_address, signal_byte, Instant::now()) {
                    drop(engine);
                    self.publish_cover_tick(telegram.source_address, result.state).await;
                }
            }
            op @ (opcodes::BROADCAST_TEMPERATURE_RESPONSE
            | opcodes::READ_SENSORS_IN_ONE_STATUS_RESPONSE
            | opcodes::READ_SENSORS_FALLBACK
            | opcodes::READ_SENSORS_ILLUMINANCE_16BIT
            | opcodes::CONTROL_PANEL_AC_RESPONSE) => {
                let reading = sensors::decode_reading(op, &telegram);
                self.publish_sensor_reading(reading).await;
            }
            other => {
                let mut sniffer = self.sniffer.write().await;
                sniffer.record(other, telegram.payload.clone());
                if self.config.debug_telegram {
                    debug!("core: unrecognized opcode raw:0x{other:04x} from {}", telegram.source_address);
                }
            }
        }
    }

    async fn publish_sensor_reading(&self, reading: SensorReading) {
        match reading {
            SensorReading::Temperature { address, sensor_id, value } => {
                let value = self.calibrate(SensorKind::Temperature, address, value).await;
                self.mqtt.publish_sensor_value("temp", address, sensor_id, value).await;
                self.realtime.broadcast(RtEvent::TempValue { address, sensor_id, value });
            }
            SensorReading::Humidity { address, sensor_id, value } => {
                let value = self.calibrate(SensorKind::Humidity, address, value).await;
                self.mqtt.publish_sensor_value("humidity", address, sensor_id, value).await;
                self.realtime.broadcast(RtEvent::HumidityValue { address, sensor_id, value });
            }
            SensorReading::Illuminance { address, sensor_id, value } => {
                let value = self.calibrate(SensorKind::Illuminance, address, value).await;
                self.mqtt.publish_sensor_value("illuminance", address, sensor_id, value).await;
                self.realtime.broadcast(RtEvent::IlluminanceValue { address, sensor_id, value });
            }
            SensorReading::DryContact { address, on, x } => {
                self.mqtt.publish_dry_contact(address, on, x).await;
                self.realtime.broadcast(RtEvent::State { address, value: json!({"on": on, "x": x}) });
            }
            SensorReading::Raw { opcode, address, bytes } => {
                let mut sniffer = self.sniffer.write().await;
                sniffer.record(opcode, bytes);
                debug!("core: raw sensor reading from {address}, opcode 0x{opcode:04x}");
            }
        }
    }

    /// Runs while any cover might be moving; ticks the cover engine and
    /// publishes/broadcasts whatever changed (spec §5 cover ticker).
    pub async fn run_cover_ticker(self: Arc<Self>) {
        let mut ticker = interval(COVER_TICK_INTERVAL);
        loop {
            ticker.tick().await;
            let results = {
                let mut engine = self.cover_engine.write().await;
                engine.tick(Instant::now()).await
            };
            for result in results {
                self.publish_cover_tick(result.address, result.state).await;
            }
        }
    }

    /// Periodic `read_status` poll: ~20 s idle, ~2 s while any cover is
    /// moving (spec §5). Polls pass through the scheduler like any other
    /// command so they never bypass pacing.
    pub async fn run_status_poller(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let any_moving = self.cover_engine.read().await.any_moving();
            let interval_for_all = if any_moving { STATUS_POLL_MOVING } else { STATUS_POLL_IDLE };
            let now = Instant::now();

            let addresses: Vec<Address> = self.registry.read().await.covers.keys().copied().collect();
            let mut last_polls = self.status_poll_last.write().await;
            for address in addresses {
                let due = last_polls.get(&address).map(|t| now.duration_since(*t) >= interval_for_all).unwrap_or(true);
                if !due {
                    continue;
                }
                last_polls.insert(address, now);
                let telegram = Telegram {
                    source_address: Address { subnet: 0, device: 0, channel: 0 },
                    destination_address: address,
                    op_code: opcodes::CURTAIN_SWITCH_READ_STATUS,
                    payload: vec![],
                };
                self.scheduler
                    .enqueue(ScheduledCommand { address, kind: CommandKind::ReadStatus, telegram })
                    .await;
            }
        }
    }
}

/// Loop body for the UDP receive channel — decodes nothing further (already
/// decoded by the transport layer) and just dispatches.
pub async fn run_udp_dispatch_loop(core: Arc<Core>, mut rx: mpsc::Receiver<(Telegram, SocketAddr)>) {
    while let Some((telegram, _from)) = rx.recv().await {
        core.process_telegram(telegram).await;
    }
}

/// Loop body for incoming MQTT commands.
pub async fn run_mqtt_command_loop(core: Arc<Core>, mut rx: mpsc::Receiver<IncomingCommand>) {
    while let Some(command) = rx.recv().await {
        core.handle_mqtt_command(command).await;
    }
}
