//! Device registry (C4): typed records + CRUD.
//!
//! Grounded on `backend-rust/src/state.rs`'s serde struct conventions and
//! `handlers.rs`'s mutate-then-broadcast pattern (the broadcast/discovery/
//! persist fan-out itself lives one layer up, in `core.rs`, since this type
//! only owns the data).

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::model::{
    Address, Cover, CoverGroup, DeviceKind, DryContact, Light, SensorDevice,
};

#[derive(Debug, Default)]
pub struct Registry {
    pub lights: HashMap<Address, Light>,
    pub covers: HashMap<Address, Cover>,
    pub cover_groups: HashMap<Uuid, CoverGroup>,
    pub dry_contacts: HashMap<Address, DryContact>,
    pub temperatures: HashMap<Address, SensorDevice>,
    pub humidities: HashMap<Address, SensorDevice>,
    pub illuminances: HashMap<Address, SensorDevice>,
}

fn insert_unique<T>(
    map: &mut HashMap<Address, T>,
    address: Address,
    record: T,
    kind: DeviceKind,
) -> BridgeResult<()> {
    if map.contains_key(&address) {
        return Err(BridgeError::Conflict { kind, address: address.to_string() });
    }
    map.insert(address, record);
    Ok(())
}

fn remove_existing<T>(map: &mut HashMap<Address, T>, address: &Address, kind: DeviceKind) -> BridgeResult<T> {
    map.remove(address)
        .ok_or_else(|| BridgeError::NotFound { kind, address: address.to_string() })
}

/// Moves a record from `old` to `new`, failing with Conflict if `new` is
/// already occupied. Used by address-edit operations (spec §4.4).
fn migrate_address<T>(
    map: &mut HashMap<Address, T>,
    old: &Address,
    new: Address,
    kind: DeviceKind,
) -> BridgeResult<()> {
    if old == &new {
        return Ok(());
    }
    if map.contains_key(&new) {
        return Err(BridgeError::Conflict { kind, address: new.to_string() });
    }
    let record = remove_existing(map, old, kind)?;
    map.insert(new, record);
    Ok(())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Lights ----

    pub fn add_light(&mut self, mut light: Light) -> BridgeResult<()> {
        let address = light.address;
        // Keep canonical address on the record itself.
        light.address = address;
        insert_unique(&mut self.lights, address, light, DeviceKind::Light)
    }

    pub fn edit_light(&mut self, address: &Address, new_address: Address, mut patch: Light) -> BridgeResult<()> {
        migrate_address(&mut self.lights, address, new_address, DeviceKind::Light)?;
        patch.address = new_address;
        self.lights.insert(new_address, patch);
        Ok(())
    }

    pub fn remove_light(&mut self, address: &Address) -> BridgeResult<Light> {
        remove_existing(&mut self.lights, address, DeviceKind::Light)
    }

    /// Keeps only the latest definition per address (spec §4.4 "dedupe").
    /// Since this registry stores one record per address already, this is
    /// a no-op by construction; exposed so callers migrating imported data
    /// with duplicate keys have a single place to call.
    pub fn dedupe_lights(&mut self, incoming: Vec<Light>) {
        for light in incoming {
            self.lights.insert(light.address, light);
        }
    }

    // ---- Covers ----

    pub fn add_cover(&mut self, cover: Cover) -> BridgeResult<()> {
        let address = cover.address;
        insert_unique(&mut self.covers, address, cover, DeviceKind::Cover)
    }

    pub fn edit_cover(&mut self, address: &Address, new_address: Address, mut patch: Cover) -> BridgeResult<()> {
        migrate_address(&mut self.covers, address, new_address, DeviceKind::Cover)?;
        patch.address = new_address;
        self.covers.insert(new_address, patch);
        Ok(())
    }

    pub fn remove_cover(&mut self, address: &Address) -> BridgeResult<Cover> {
        remove_existing(&mut self.covers, address, DeviceKind::Cover)
    }

    // ---- Cover groups ----

    pub fn add_cover_group(&mut self, group: CoverGroup) -> Uuid {
        let id = group.id;
        self.cover_groups.insert(id, group);
        id
    }

    pub fn edit_cover_group(&mut self, id: &Uuid, patch: CoverGroup) -> BridgeResult<()> {
        if !self.cover_groups.contains_key(id) {
            return Err(BridgeError::NotFound { kind: DeviceKind::CoverGroup, address: id.to_string() });
        }
        // `id` is stable across renames: keep the original key.
        self.cover_groups.insert(*id, patch);
        Ok(())
    }

    pub fn remove_cover_group(&mut self, id: &Uuid) -> BridgeResult<CoverGroup> {
        self.cover_groups
            .remove(id)
            .ok_or_else(|| BridgeError::NotFound { kind: DeviceKind::CoverGroup, address: id.to_string() })
    }

    // ---- Dry contacts ----

    pub fn add_dry_contact(&mut self, contact: DryContact) -> BridgeResult<()> {
        let address = contact.address;
        insert_unique(&mut self.dry_contacts, address, contact, DeviceKind::DryContact)
    }

    pub fn remove_dry_contact(&mut self, address: &Address) -> BridgeResult<DryContact> {
        remove_existing(&mut self.dry_contacts, address, DeviceKind::DryContact)
    }

    // ---- Sensors ----

    pub fn add_temperature(&mut self, sensor: SensorDevice) -> BridgeResult<()> {
        let address = sensor.address;
        insert_unique(&mut self.temperatures, address, sensor, DeviceKind::Temperature)
    }

    pub fn add_humidity(&mut self, sensor: SensorDevice) -> BridgeResult<()> {
        let address = sensor.address;
        insert_unique(&mut self.humidities, address, sensor, DeviceKind::Humidity)
    }

    pub fn add_illuminance(&mut self, sensor: SensorDevice) -> BridgeResult<()> {
        let address = sensor.address;
        insert_unique(&mut self.illuminances, address, sensor, DeviceKind::Illuminance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light_at(subnet: u8, device: u8, channel: u8) -> Light {
        Light {
            address: Address { subnet, device, channel },
            name: "test".into(),
            dimmable: true,
            category: "light".into(),
            icon: None,
            group: None,
        }
    }

    #[test]
    fn duplicate_address_is_conflict() {
        let mut reg = Registry::new();
        reg.add_light(light_at(1, 1, 1)).unwrap();
        let err = reg.add_light(light_at(1, 1, 1)).unwrap_err();
        assert!(matches!(err, BridgeError::Conflict { .. }));
    }

    #[test]
    fn remove_missing_is_not_found() {
        let mut reg = Registry::new();
        let err = reg.remove_light(&Address { subnet: 9, device: 9, channel: 9 }).unwrap_err();
        assert!(matches!(err, BridgeError::NotFound { .. }));
    }

    #[test]
    fn edit_to_occupied_address_is_conflict() {
        let mut reg = Registry::new();
        reg.add_light(light_at(1, 1, 1)).unwrap();
        reg.add_light(light_at(1, 1, 2)).unwrap();
        let err = reg
            .edit_light(&Address { subnet: 1, device: 1, channel: 1 }, Address { subnet: 1, device: 1, channel: 2 }, light_at(1, 1, 1))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Conflict { .. }));
    }

    #[test]
    fn cover_group_id_is_stable_across_rename() {
        let mut reg = Registry::new();
        let id = Uuid::new_v4();
        let group = CoverGroup { id, name: "Living room".into(), member_addresses: vec![], icon: None, category: None };
        reg.add_cover_group(group);
        let renamed = CoverGroup { id, name: "Lounge".into(), member_addresses: vec![], icon: None, category: None };
        reg.edit_cover_group(&id, renamed).unwrap();
        assert_eq!(reg.cover_groups.get(&id).unwrap().name, "Lounge");
    }
}
