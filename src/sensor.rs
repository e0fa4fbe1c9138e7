//! Sensor definitions built from the device's config descriptors.
//!
//! Each config slot describes one sensor. Telemetry frames carry no sensor
//! ids, only a flat list of fields, so the position of a sensor's values in
//! that list is found by laying the sensors out one after another in slot
//! order, each taking as many fields as its type needs.

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::Fields;

const TYPE_NULL: u16 = 0;
const TYPE_VOLT: u16 = 1;
const TYPE_CURRENT: u16 = 2;
const TYPE_THERMOMETER: u16 = 3;
const TYPE_BAROMETER: u16 = 5;
const TYPE_OHM: u16 = 6;
const TYPE_TANK: u16 = 8;
const TYPE_BATTERY: u16 = 9;
const TYPE_RESERVED: u16 = 14;

// Descriptor field numbers
const FIELD_ID: usize = 0;
const FIELD_TYPE: usize = 1;
const FIELD_NAME: usize = 3;
const FIELD_BATTERY_CAPACITY: usize = 5;
const FIELD_FLUID: usize = 6;
const FIELD_TANK_CAPACITY: usize = 7;

/// The device's own supply voltages are reported as one volt sensor with
/// this name spanning several fields.
const INTERNAL_VOLT_NAME: &str = "PICO INTERNAL";
const INTERNAL_VOLT_ELEMENTS: usize = 6;

/// Converts the configured battery capacity (Ah) to Joules at 12V.
const NOMINAL_CAPACITY_FACTOR: f64 = 36.0 * 12.0;

/// What a tank holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluidKind {
    Unknown,
    FreshWater,
    Fuel,
    WasteWater,
}

impl FluidKind {
    const ALL: [FluidKind; 4] =
        [FluidKind::Unknown, FluidKind::FreshWater, FluidKind::Fuel, FluidKind::WasteWater];

    pub fn from_raw(raw: u16) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }

    pub fn key(self) -> &'static str {
        match self {
            FluidKind::Unknown => "Unknown",
            FluidKind::FreshWater => "freshWater",
            FluidKind::Fuel => "fuel",
            FluidKind::WasteWater => "wasteWater",
        }
    }

    /// Human readable name
    pub fn label(self) -> &'static str {
        match self {
            FluidKind::Unknown => "Unknown",
            FluidKind::FreshWater => "fresh water",
            FluidKind::Fuel => "diesel",
            FluidKind::WasteWater => "blackwater",
        }
    }
}

/// The semantic type of a sensor and the static attributes its readings need.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorKind {
    /// An unused slot; takes no telemetry fields
    Null,
    Volt { name: Option<String> },
    Current { name: Option<String> },
    Thermometer { name: Option<String> },
    Barometer { name: Option<String> },
    Ohm { name: Option<String> },
    Tank {
        name: Option<String>,
        /// Litres
        capacity: f64,
        fluid: FluidKind,
    },
    Battery {
        name: Option<String>,
        /// Joules
        nominal_capacity: f64,
    },
    /// Takes one telemetry field that we do not interpret
    Reserved,
    /// A type code we have never seen. Assumed to take one field.
    Unknown { code: u16 },
}

impl SensorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SensorKind::Null => "null",
            SensorKind::Volt { .. } => "volt",
            SensorKind::Current { .. } => "current",
            SensorKind::Thermometer { .. } => "thermometer",
            SensorKind::Barometer { .. } => "barometer",
            SensorKind::Ohm { .. } => "ohm",
            SensorKind::Tank { .. } => "tank",
            SensorKind::Battery { .. } => "battery",
            SensorKind::Reserved => "reserved",
            SensorKind::Unknown { .. } => "unknown",
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            SensorKind::Volt { name }
            | SensorKind::Current { name }
            | SensorKind::Thermometer { name }
            | SensorKind::Barometer { name }
            | SensorKind::Ohm { name }
            | SensorKind::Tank { name, .. }
            | SensorKind::Battery { name, .. } => name.as_deref(),
            SensorKind::Null | SensorKind::Reserved | SensorKind::Unknown { .. } => None,
        }
    }

    /// How many consecutive telemetry fields the sensor occupies.
    pub fn element_count(&self) -> usize {
        match self {
            SensorKind::Null => 0,
            SensorKind::Volt { name } if name.as_deref() == Some(INTERNAL_VOLT_NAME) => {
                INTERNAL_VOLT_ELEMENTS
            }
            SensorKind::Current { .. } | SensorKind::Barometer { .. } => 2,
            SensorKind::Battery { .. } => 5,
            _ => 1,
        }
    }

    /// Interpret one config descriptor. `slot` is only used in errors.
    fn from_descriptor(slot: usize, code: u16, fields: &Fields) -> Result<Self> {
        let name = || fields.text(FIELD_NAME).map(str::to_owned);
        let value = |number: usize, what: &str| {
            fields.pair(number).map(|(_, value)| value).ok_or_else(|| Error::InvalidConfig {
                pos: slot,
                reason: format!("missing {what} (field {number})"),
            })
        };

        let kind = match code {
            TYPE_NULL => SensorKind::Null,
            TYPE_VOLT => SensorKind::Volt { name: name() },
            TYPE_CURRENT => SensorKind::Current { name: name() },
            TYPE_THERMOMETER => SensorKind::Thermometer { name: name() },
            TYPE_BAROMETER => SensorKind::Barometer { name: name() },
            TYPE_OHM => SensorKind::Ohm { name: name() },
            TYPE_TANK => {
                let capacity = f64::from(value(FIELD_TANK_CAPACITY, "tank capacity")?) / 10.0;
                let raw_fluid = value(FIELD_FLUID, "fluid kind")?;
                let fluid = FluidKind::from_raw(raw_fluid).ok_or_else(|| Error::InvalidConfig {
                    pos: slot,
                    reason: format!("fluid kind {raw_fluid} out of range"),
                })?;
                SensorKind::Tank { name: name(), capacity, fluid }
            }
            TYPE_BATTERY => {
                let capacity = value(FIELD_BATTERY_CAPACITY, "battery capacity")?;
                SensorKind::Battery {
                    name: name(),
                    nominal_capacity: f64::from(capacity) * NOMINAL_CAPACITY_FACTOR,
                }
            }
            TYPE_RESERVED => SensorKind::Reserved,
            code => {
                warn!(slot, code, "unrecognized sensor type, assuming one telemetry field");
                SensorKind::Unknown { code }
            }
        };
        Ok(kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    /// Assigned by the device
    pub id: u16,
    /// Index of the sensor's first field in a telemetry frame
    pub pos: usize,
    pub kind: SensorKind,
}

impl Sensor {
    pub fn element_count(&self) -> usize {
        self.kind.element_count()
    }
}

impl Serialize for Sensor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.kind.type_name())?;
        map.serialize_entry("pos", &self.pos)?;
        if let Some(name) = self.kind.name() {
            map.serialize_entry("name", name)?;
        }
        match &self.kind {
            SensorKind::Tank { capacity, fluid, .. } => {
                map.serialize_entry("capacity", capacity)?;
                map.serialize_entry("fluid_type", fluid.label())?;
                map.serialize_entry("fluid", fluid.key())?;
            }
            SensorKind::Battery { nominal_capacity, .. } => {
                map.serialize_entry("capacity.nominal", nominal_capacity)?;
            }
            SensorKind::Unknown { code } => {
                map.serialize_entry("code", code)?;
            }
            _ => {}
        }
        map.end()
    }
}

/// All sensors of a device keyed by id. Built once from the config and only
/// read afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SensorRegistry {
    sensors: BTreeMap<u16, Sensor>,
}

impl SensorRegistry {
    /// Build the registry from the descriptors of all slots, in slot order.
    pub fn build(config: &[Fields]) -> Result<Self> {
        let mut sensors = BTreeMap::new();
        let mut element_pos = 0;

        for (slot, fields) in config.iter().enumerate() {
            let (id, code) = match (fields.pair(FIELD_ID), fields.pair(FIELD_TYPE)) {
                (Some((_, id)), Some((_, code))) => (id, code),
                _ => {
                    return Err(Error::InvalidConfig {
                        pos: slot,
                        reason: "descriptor has no id or type".to_owned(),
                    })
                }
            };
            let kind = SensorKind::from_descriptor(slot, code, fields)?;
            let sensor = Sensor { id, pos: element_pos, kind };
            element_pos += sensor.element_count();

            debug!(slot, id, kind = sensor.kind.type_name(), pos = sensor.pos, "registered sensor");
            if let Some(previous) = sensors.insert(id, sensor) {
                warn!(slot, id, previous = previous.kind.type_name(), "duplicate sensor id replaces earlier slot");
            }
        }

        Ok(Self { sensors })
    }

    pub fn get(&self, id: u16) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Number of telemetry fields the registered sensors span
    pub fn element_count(&self) -> usize {
        self.iter().map(|sensor| sensor.pos + sensor.element_count()).max().unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) fn descriptor(id: u16, code: u16, name: Option<&str>) -> Fields {
    use crate::frame::Field;
    let mut fields = vec![Field::compact(0, 0, id), Field::compact(1, 0, code)];
    if let Some(name) = name {
        fields.push(Field::text(3, name));
    }
    fields.into_iter().collect()
}

#[cfg(test)]
fn with_value(mut fields: Fields, number: u8, value: u16) -> Fields {
    fields.insert(number, crate::frame::FieldValue::Pair(0, value));
    fields
}

#[test]
fn test_layout_tiles_frame() {
    let config = vec![
        descriptor(10, TYPE_NULL, None),
        descriptor(11, TYPE_VOLT, Some("PICO INTERNAL")),
        descriptor(12, TYPE_CURRENT, Some("Shunt")),
        descriptor(13, TYPE_THERMOMETER, Some("Engine Room")),
        descriptor(14, TYPE_BAROMETER, Some("Baro")),
        descriptor(15, TYPE_OHM, Some("Resistive")),
        with_value(with_value(descriptor(16, TYPE_TANK, Some("Water")), 6, 1), 7, 1500),
        with_value(descriptor(17, TYPE_BATTERY, Some("House")), 5, 200),
        descriptor(18, TYPE_RESERVED, None),
        descriptor(19, TYPE_VOLT, Some("Starter")),
    ];
    let registry = SensorRegistry::build(&config).unwrap();

    let positions: Vec<(u16, usize)> = registry.iter().map(|s| (s.id, s.pos)).collect();
    assert_eq!(
        positions,
        vec![(10, 0), (11, 0), (12, 6), (13, 8), (14, 9), (15, 11), (16, 12), (17, 13), (18, 18), (19, 19)]
    );

    let mut sensors: Vec<&Sensor> = registry.iter().collect();
    sensors.sort_by_key(|s| (s.pos, s.element_count()));
    let mut next = 0;
    for sensor in sensors.iter().filter(|s| s.element_count() > 0) {
        assert_eq!(sensor.pos, next, "gap or overlap at sensor {}", sensor.id);
        next += sensor.element_count();
    }
    assert_eq!(next, registry.element_count());
    assert_eq!(registry.element_count(), 20);
}

#[test]
fn test_static_attributes() {
    let config = vec![
        with_value(with_value(descriptor(1, TYPE_TANK, Some("Fuel")), 6, 2), 7, 2005),
        with_value(descriptor(2, TYPE_BATTERY, Some("House")), 5, 100),
    ];
    let registry = SensorRegistry::build(&config).unwrap();

    assert_eq!(
        registry.get(1).unwrap().kind,
        SensorKind::Tank { name: Some("Fuel".to_owned()), capacity: 200.5, fluid: FluidKind::Fuel }
    );
    assert_eq!(
        registry.get(2).unwrap().kind,
        SensorKind::Battery { name: Some("House".to_owned()), nominal_capacity: 43200.0 }
    );
    assert_eq!(registry.get(2).unwrap().pos, 1);
}

#[test]
fn test_fluid_kind_out_of_range() {
    let config = vec![
        descriptor(1, TYPE_THERMOMETER, None),
        with_value(with_value(descriptor(2, TYPE_TANK, None), 6, 4), 7, 10),
    ];
    match SensorRegistry::build(&config) {
        Err(Error::InvalidConfig { pos: 1, .. }) => {}
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn test_missing_id() {
    let config = vec![crate::frame::Fields::new()];
    assert!(matches!(SensorRegistry::build(&config), Err(Error::InvalidConfig { pos: 0, .. })));
}

#[test]
fn test_unknown_type_takes_one_field() {
    let config = vec![descriptor(1, 42, None), descriptor(2, TYPE_THERMOMETER, None)];
    let registry = SensorRegistry::build(&config).unwrap();
    assert_eq!(registry.get(1).unwrap().kind, SensorKind::Unknown { code: 42 });
    assert_eq!(registry.get(2).unwrap().pos, 1);
}

#[test]
fn test_serialize_sensor() {
    let config = vec![with_value(with_value(descriptor(7, TYPE_TANK, Some("Grey")), 6, 3), 7, 800)];
    let registry = SensorRegistry::build(&config).unwrap();
    let json = serde_json::to_value(&registry).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "7": {
                "type": "tank",
                "pos": 0,
                "name": "Grey",
                "capacity": 80.0,
                "fluid_type": "blackwater",
                "fluid": "wasteWater"
            }
        })
    );
}

#[test]
fn test_serialize_reserved_slot() {
    let config = vec![descriptor(1, TYPE_THERMOMETER, None), descriptor(2, TYPE_RESERVED, None)];
    let registry = SensorRegistry::build(&config).unwrap();
    assert_eq!(
        serde_json::to_value(registry.get(2).unwrap()).unwrap(),
        serde_json::json!({ "type": "reserved", "pos": 1 })
    );
}
