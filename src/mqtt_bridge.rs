//! MQTT bridge (C7): discovery, retained state with dedupe, subscribe and
//! resubscribe on reconnect.
//!
//! No teacher module talks MQTT at all; this follows the `rumqttc`
//! reconnect/resubscribe idiom from `rhoopr-bambutop`'s `mqtt.rs`
//! (`ConnAck` handler re-subscribes and re-publishes on every connection,
//! since `clean_session=true` drops broker-side subscriptions) — the
//! corpus-wide idiomatic choice for MQTT (confirmed against
//! `other_examples/manifests/*.toml`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{Address, Cover, CoverGroup, DryContact, Light};
use crate::registry::Registry;
use crate::store::Store;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const COMMAND_WILDCARDS: &[&str] = &[
    "cmd/light/#",
    "cmd/cover/#",
    "cmd/cover_raw/#",
    "cmd/cover_pos/#",
    "cmd/cover_group/#",
    "cmd/cover_group_raw/#",
    "cmd/cover_group_pos/#",
];

#[derive(Debug, Clone)]
pub enum IncomingCommand {
    Light { address: Address, on: bool, brightness: Option<u8> },
    CoverOpen { address: Address },
    CoverClose { address: Address },
    CoverStop { address: Address },
    CoverSetPosition { address: Address, position: u8 },
    CoverRaw { address: Address, raw: String },
    CoverGroupOpen { id: uuid::Uuid },
    CoverGroupClose { id: uuid::Uuid },
    CoverGroupStop { id: uuid::Uuid },
    CoverGroupSetPosition { id: uuid::Uuid, position: u8 },
    CoverGroupRaw { id: uuid::Uuid, raw: String },
}

fn parse_address(segment: &str) -> Option<Address> {
    let mut parts = segment.split('/');
    let subnet = parts.next()?.parse().ok()?;
    let device = parts.next()?.parse().ok()?;
    let channel = parts.next()?.parse().ok()?;
    Some(Address { subnet, device, channel })
}

fn parse_command(topic: &str, payload: &[u8]) -> Option<IncomingCommand> {
    let body = std::str::from_utf8(payload).ok()?;
    let mut segments = topic.splitn(2, '/');
    let _cmd = segments.next()?; // "cmd"
    let rest = segments.next()?;
    let mut rest_parts = rest.splitn(2, '/');
    let kind = rest_parts.next()?;
    let target = rest_parts.next()?;

    match kind {
        "light" => {
            let address = parse_address(target)?;
            let value: Value = serde_json::from_str(body).ok()?;
            let on = value.get("state").and_then(|s| s.as_str()).map(|s| s.eq_ignore_ascii_case("on")).unwrap_or(false);
            let brightness = value.get("brightness").and_then(|b| b.as_u64()).map(|b| b as u8);
            Some(IncomingCommand::Light { address, on, brightness })
        }
        "cover" => {
            let address = parse_address(target)?;
            match body.to_uppercase().as_str() {
                "OPEN" => Some(IncomingCommand::CoverOpen { address }),
                "CLOSE" => Some(IncomingCommand::CoverClose { address }),
                "STOP" => Some(IncomingCommand::CoverStop { address }),
                _ => body.parse::<u8>().ok().map(|pos| IncomingCommand::CoverSetPosition { address, position: pos }),
            }
        }
        "cover_pos" => {
            let address = parse_address(target)?;
            let position: u8 = body.parse().ok()?;
            Some(IncomingCommand::CoverSetPosition { address, position })
        }
        "cover_raw" => {
            let address = parse_address(target)?;
            Some(IncomingCommand::CoverRaw { address, raw: body.to_string() })
        }
        "cover_group" => {
            let id: uuid::Uuid = target.parse().ok()?;
            match body.to_uppercase().as_str() {
                "OPEN" => Some(IncomingCommand::CoverGroupOpen { id }),
                "CLOSE" => Some(IncomingCommand::CoverGroupClose { id }),
                "STOP" => Some(IncomingCommand::CoverGroupStop { id }),
                _ => body.parse::<u8>().ok().map(|pos| IncomingCommand::CoverGroupSetPosition { id, position: pos }),
            }
        }
        "cover_group_pos" => {
            let id: uuid::Uuid = target.parse().ok()?;
            let position: u8 = body.parse().ok()?;
            Some(IncomingCommand::CoverGroupSetPosition { id, position })
        }
        "cover_group_raw" => {
            let id: uuid::Uuid = target.parse().ok()?;
            Some(IncomingCommand::CoverGroupRaw { id, raw: body.to_string() })
        }
        _ => None,
    }
}

/// Deterministic object ID from address, so renames never create duplicate
/// discovery entities (spec §4.7).
fn object_id(prefix: &str, address: &Address) -> String {
    format!("{prefix}_{}_{}_{}", address.subnet, address.device, address.channel)
}

#[derive(Clone)]
pub struct MqttBridge {
    client: AsyncClient,
    prefix: String,
    store: Arc<Store>,
}

impl MqttBridge {
    fn topic(&self, tail: &str) -> String {
        format!("{}{}", self.prefix, tail)
    }

    async fn publish_retained<T: Serialize>(&self, key: &str, tail: &str, value: &T) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        if !self.store.check_and_update(key, &value).await {
            return; // unchanged — suppressed per spec §4.7/§8 invariant 6
        }
        let payload = value.to_string();
        if let Err(e) = self.client.publish(self.topic(tail), QoS::AtLeastOnce, true, payload).await {
            warn!("mqtt: publish {tail} failed: {e}");
        }
    }

    pub async fn publish_light_state(&self, address: Address, on: bool, brightness: Option<u8>) {
        let key = format!("light/{address}");
        let tail = format!("state/light/{}/{}/{}", address.subnet, address.device, address.channel);
        self.publish_retained(&key, &tail, &json!({ "state": if on { "ON" } else { "OFF" }, "brightness": brightness })).await;
    }

    pub async fn publish_cover_state(&self, address: Address, state_str: &str, position: u8) {
        let key = format!("cover/{address}");
        let tail = format!("state/cover/{}/{}/{}", address.subnet, address.device, address.channel);
        self.publish_retained(&key, &tail, &json!({ "state": state_str, "position": position })).await;
    }

    pub async fn publish_sensor_value(&self, kind_path: &str, address: Address, sensor_id: u8, value: f64) {
        let key = format!("{kind_path}/{address}/{sensor_id}");
        let tail = format!("state/{kind_path}/{}/{}/{}", address.subnet, address.device, sensor_id);
        if self.store.check_and_update(&key, &json!(value)).await {
            if let Err(e) = self.client.publish(self.topic(&tail), QoS::AtMostOnce, true, value.to_string()).await {
                warn!("mqtt: publish {tail} failed: {e}");
            }
        }
    }

    pub async fn publish_dry_contact(&self, address: Address, on: bool, x: u8) {
        let key = format!("dry_contact/{address}");
        let tail = format!("state/dry_contact/{}/{}/{}", address.subnet, address.device, address.channel);
        if self.store.check_and_update(&key, &json!({ "on": on, "x": x })).await {
            let payload = if on { "ON" } else { "OFF" };
            if let Err(e) = self.client.publish(self.topic(&tail), QoS::AtMostOnce, true, payload).await {
                warn!("mqtt: publish {tail} failed: {e}");
            }
            let attrs_tail = format!("state/dry_contact/{}/{}/{}/attributes", address.subnet, address.device, address.channel);
            let _ = self.client.publish(self.topic(&attrs_tail), QoS::AtMostOnce, true, json!({"x": x}).to_string()).await;
        }
    }

    async fn publish_discovery_light(&self, light: &Light) {
        let oid = object_id("light", &light.address);
        let tail = format!("discovery/light/{oid}/config");
        let payload = json!({
            "name": light.name,
            "unique_id": oid,
            "state_topic": self.topic(&format!("state/light/{}/{}/{}", light.address.subnet, light.address.device, light.address.channel)),
            "command_topic": self.topic(&format!("cmd/light/{}/{}/{}", light.address.subnet, light.address.device, light.address.channel)),
            "brightness": light.dimmable,
            "device": { "identifiers": ["buspro_lights"], "name": "BusPro Lights" },
        });
        let _ = self.client.publish(self.topic(&tail), QoS::AtLeastOnce, true, payload.to_string()).await;
    }

    async fn publish_discovery_cover(&self, cover: &Cover) {
        let oid = object_id("cover", &cover.address);
        let tail = format!("discovery/cover/{oid}/config");
        let payload = json!({
            "name": cover.name,
            "unique_id": oid,
            "state_topic": self.topic(&format!("state/cover/{}/{}/{}", cover.address.subnet, cover.address.device, cover.address.channel)),
            "command_topic": self.topic(&format!("cmd/cover/{}/{}/{}", cover.address.subnet, cover.address.device, cover.address.channel)),
            "position_topic": self.topic(&format!("state/cover/{}/{}/{}", cover.address.subnet, cover.address.device, cover.address.channel)),
            "set_position_topic": self.topic(&format!("cmd/cover_pos/{}/{}/{}", cover.address.subnet, cover.address.device, cover.address.channel)),
            "device": { "identifiers": [format!("buspro_covers_{}", cover.category)], "name": format!("BusPro Covers ({})", cover.category) },
        });
        let _ = self.client.publish(self.topic(&tail), QoS::AtLeastOnce, true, payload.to_string()).await;

        // "no-%" clone: OPEN/CLOSE/STOP only, assumed_state, raw command topics.
        let raw_oid = format!("{oid}_raw");
        let raw_tail = format!("discovery/cover/{raw_oid}/config");
        let raw_payload = json!({
            "name": format!("{} (raw)", cover.name),
            "unique_id": raw_oid,
            "command_topic": self.topic(&format!("cmd/cover_raw/{}/{}/{}", cover.address.subnet, cover.address.device, cover.address.channel)),
            "assumed_state": true,
            "device": { "identifiers": ["buspro_covers_raw"], "name": "BusPro Covers (raw)" },
        });
        let _ = self.client.publish(self.topic(&raw_tail), QoS::AtLeastOnce, true, raw_payload.to_string()).await;
    }

    async fn publish_discovery_cover_group(&self, group: &CoverGroup) {
        let tail = format!("discovery/cover/group_{}/config", group.id);
        let payload = json!({
            "name": group.name,
            "unique_id": group.id,
            "state_topic": self.topic(&format!("state/cover_group/{}", group.id)),
            "command_topic": self.topic(&format!("cmd/cover_group/{}", group.id)),
            "set_position_topic": self.topic(&format!("cmd/cover_group_pos/{}", group.id)),
        });
        let _ = self.client.publish(self.topic(&tail), QoS::AtLeastOnce, true, payload.to_string()).await;
    }

    async fn publish_discovery_dry_contact(&self, contact: &DryContact) {
        let oid = object_id("dry_contact", &contact.address);
        let tail = format!("discovery/binary_sensor/{oid}/config");
        let payload = json!({
            "name": contact.name,
            "unique_id": oid,
            "state_topic": self.topic(&format!("state/dry_contact/{}/{}/{}", contact.address.subnet, contact.address.device, contact.address.channel)),
        });
        let _ = self.client.publish(self.topic(&tail), QoS::AtLeastOnce, true, payload.to_string()).await;
    }

    /// Republishes availability + full discovery. Called on every connect
    /// and every reconnect (spec §4.7) so stale/missing retained discovery
    /// never leaves devices un-auto-populated.
    pub async fn republish_discovery(&self, registry: &Registry) {
        let _ = self.client.publish(self.topic("availability"), QoS::AtLeastOnce, true, "online").await;

        for light in registry.lights.values() {
            self.publish_discovery_light(light).await;
        }
        for cover in registry.covers.values() {
            self.publish_discovery_cover(cover).await;
        }
        for group in registry.cover_groups.values() {
            self.publish_discovery_cover_group(group).await;
        }
        for contact in registry.dry_contacts.values() {
            self.publish_discovery_dry_contact(contact).await;
        }
    }

    async fn resubscribe(&self) {
        for topic in COMMAND_WILDCARDS {
            if let Err(e) = self.client.subscribe(*topic, QoS::AtLeastOnce).await {
                warn!("mqtt: subscribe {topic} failed: {e}");
            }
        }
    }
}

/// Spawns the MQTT client's event-loop task. Returns a `MqttBridge` handle
/// for publish calls plus a receiver of parsed incoming commands.
pub fn spawn(
    config: &Config,
    registry: Arc<RwLock<Registry>>,
    store: Arc<Store>,
) -> (MqttBridge, mpsc::Receiver<IncomingCommand>) {
    let client_id = format!("buspro-bridge-{}", std::process::id());
    let mut opts = MqttOptions::new(client_id, config.mqtt.host.clone(), config.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (&config.mqtt.username, &config.mqtt.password) {
        opts.set_credentials(username, password);
    }
    opts.set_last_will(rumqttc::LastWill::new(
        format!("{}availability", config.mqtt.prefix),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));

    let (client, mut eventloop) = AsyncClient::new(opts, 64);
    let bridge = MqttBridge { client, prefix: config.mqtt.prefix.clone(), store };
    let (tx, rx) = mpsc::channel(256);

    let task_bridge = bridge.clone();
    let task_registry = registry;
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt: connected, republishing discovery and resubscribing");
                    let registry_snapshot = task_registry.read().await;
                    task_bridge.republish_discovery(&registry_snapshot).await;
                    drop(registry_snapshot);
                    task_bridge.resubscribe().await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(command) = parse_command(&publish.topic, &publish.payload) {
                        if tx.send(command).await.is_err() {
                            debug!("mqtt: command channel closed");
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(ConnectionError::Io(e)) => {
                    warn!("mqtt: I/O error: {e}, retrying in {}s", RECONNECT_DELAY.as_secs());
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
                Err(e) => {
                    warn!("mqtt: connection error: {e}, retrying in {}s", RECONNECT_DELAY.as_secs());
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    });

    (bridge, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_light_command() {
        let cmd = parse_command("cmd/light/1/100/2", br#"{"state":"ON","brightness":128}"#).unwrap();
        match cmd {
            IncomingCommand::Light { address, on, brightness } => {
                assert_eq!(address, Address { subnet: 1, device: 100, channel: 2 });
                assert!(on);
                assert_eq!(brightness, Some(128));
            }
            _ => panic!("expected Light"),
        }
    }

    #[test]
    fn parses_cover_raw_commands() {
        let open = parse_command("cmd/cover/1/50/1", b"OPEN").unwrap();
        assert!(matches!(open, IncomingCommand::CoverOpen { .. }));
        let stop = parse_command("cmd/cover/1/50/1", b"STOP").unwrap();
        assert!(matches!(stop, IncomingCommand::CoverStop { .. }));
        let pos = parse_command("cmd/cover/1/50/1", b"42").unwrap();
        assert!(matches!(pos, IncomingCommand::CoverSetPosition { position: 42, .. }));
    }

    #[test]
    fn object_id_is_stable_and_address_derived() {
        let a = Address { subnet: 1, device: 100, channel: 2 };
        assert_eq!(object_id("light", &a), object_id("light", &a));
        assert_eq!(object_id("light", &a), "light_1_100_2");
    }
}
