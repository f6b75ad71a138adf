//! Device and state types (spec §3).
//!
//! Mirrors the teacher's `state.rs` serde conventions (explicit
//! `rename_all`, `skip_serializing_if` on optional fields) but with BusPro's
//! domain types instead of the teacher's race/boat/team types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// (subnet, device, channel) — uniquely identifies one input/output on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub subnet: u8,
    pub device: u8,
    pub channel: u8,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subnet, self.device, self.channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Light,
    Cover,
    CoverGroup,
    DryContact,
    Temperature,
    Humidity,
    Illuminance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Light {
    pub address: Address,
    pub name: String,
    pub dimmable: bool,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightState {
    pub on: bool,
    pub brightness: u8,
}

impl LightState {
    /// round(b·100/255); on with brightness>0 sends at least 1%.
    pub fn send_percent(&self) -> Option<u8> {
        if !self.on {
            return Some(0);
        }
        if self.brightness == 0 {
            // on without a known brightness: let the bus device choose 100%.
            return None;
        }
        let pct = ((self.brightness as u32 * 100 + 127) / 255).max(1).min(100);
        Some(pct as u8)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cover {
    pub address: Address,
    pub name: String,
    pub opening_time_up_s: f64,
    pub opening_time_down_s: f64,
    pub start_delay_s: f64,
    pub reverse_icon: bool,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverPhase {
    Idle,
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverState {
    pub phase: CoverPhase,
    pub position: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<u8>,
    pub last_command_ts_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_scheduled_at_ms: Option<u64>,
}

impl CoverState {
    pub fn idle_at(position: u8) -> Self {
        Self {
            phase: CoverPhase::Idle,
            position,
            target: None,
            last_command_ts_ms: 0,
            stop_scheduled_at_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverGroup {
    /// Stable UUID, never changes on rename.
    pub id: uuid::Uuid,
    pub name: String,
    pub member_addresses: Vec<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryContact {
    pub address: Address,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryContactState {
    pub on: bool,
    /// Raw first payload byte, retained for diagnostics.
    pub x: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorFormat {
    Float32Le,
    Uint8,
    Uint16Le,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDevice {
    pub address: Address,
    pub sensor_id: u8,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    pub min: f64,
    pub max: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    pub format: SensorFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Reading(f64),
    Undefined,
}

impl SensorValue {
    pub fn from_option(value: Option<f64>) -> Self {
        match value {
            Some(v) => SensorValue::Reading(v),
            None => SensorValue::Undefined,
        }
    }
}

/// Applies a registered sensor's `scale`/`offset`/`decimals` to a raw decoded
/// reading, in that order, before it is ever published (spec §4.6).
pub fn apply_calibration(device: &SensorDevice, raw: f64) -> f64 {
    let calibrated = raw * device.scale.unwrap_or(1.0) + device.offset.unwrap_or(0.0);
    match device.decimals {
        Some(decimals) => {
            let factor = 10f64.powi(decimals as i32);
            (calibrated * factor).round() / factor
        }
        None => calibrated,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiConfig {
    pub group_order: Vec<String>,
    pub cover_groups: Vec<uuid::Uuid>,
    pub hub_links: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_percent_off_is_zero() {
        let s = LightState { on: false, brightness: 200 };
        assert_eq!(s.send_percent(), Some(0));
    }

    #[test]
    fn send_percent_on_unknown_brightness_omits_value() {
        let s = LightState { on: true, brightness: 0 };
        assert_eq!(s.send_percent(), None);
    }

    #[test]
    fn send_percent_stays_in_1_to_100_for_any_nonzero_brightness() {
        for b in 1u8..=255 {
            let s = LightState { on: true, brightness: b };
            let pct = s.send_percent().unwrap();
            assert!((1..=100).contains(&pct), "b={b} pct={pct}");
        }
    }

    #[test]
    fn round_trip_within_two_percent() {
        for b in 1u8..=255 {
            let pct = LightState { on: true, brightness: b }.send_percent().unwrap();
            let back = ((pct as u32 * 255 + 50) / 100) as i32;
            assert!((back - b as i32).abs() <= 2 || pct == 100, "b={b} pct={pct} back={back}");
        }
    }

    proptest::proptest! {
        #[test]
        fn send_percent_never_panics_and_stays_in_range(on: bool, brightness: u8) {
            let pct = LightState { on, brightness }.send_percent();
            if let Some(pct) = pct {
                proptest::prop_assert!(pct <= 100);
                if on && brightness > 0 {
                    proptest::prop_assert!(pct >= 1);
                }
            }
        }
    }

    fn sensor_device() -> SensorDevice {
        SensorDevice {
            address: Address { subnet: 1, device: 2, channel: 0 },
            sensor_id: 1,
            name: "test".into(),
            decimals: Some(1),
            min: -40.0,
            max: 80.0,
            scale: Some(0.5),
            offset: Some(2.0),
            format: SensorFormat::Float32Le,
        }
    }

    #[test]
    fn apply_calibration_scales_offsets_and_rounds() {
        // 10 * 0.5 + 2.0 = 7.0, unaffected by rounding to one decimal.
        assert_eq!(apply_calibration(&sensor_device(), 10.0), 7.0);
    }

    #[test]
    fn apply_calibration_without_scale_or_offset_is_identity_when_rounded() {
        let device = SensorDevice { scale: None, offset: None, decimals: None, ..sensor_device() };
        assert_eq!(apply_calibration(&device, 21.37), 21.37);
    }

    #[test]
    fn sensor_value_from_option_round_trips() {
        assert_eq!(SensorValue::from_option(Some(5.0)), SensorValue::Reading(5.0));
        assert_eq!(SensorValue::from_option(None), SensorValue::Undefined);
    }
}
