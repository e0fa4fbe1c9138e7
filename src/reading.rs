use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::frame::{FieldValue, Fields};
use crate::sensor::{Sensor, SensorKind, SensorRegistry};

/// Raw state of charge reported when the monitor does not know it
const SOC_UNKNOWN: u16 = 65535;
/// Raw current values above this are charging
const CURRENT_DIRECTION_THRESHOLD: u16 = 25000;
/// Stand-in for a time remaining estimate that makes no sense
const TIME_REMAINING_UNKNOWN_S: u64 = 60 * 60 * 24 * 7;

/// The values computed for one sensor from one telemetry frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    Barometer {
        /// Pa
        pressure: u32,
    },
    Thermometer {
        /// K
        temperature: f64,
    },
    Battery {
        /// 0-1
        #[serde(rename = "stateOfCharge")]
        state_of_charge: f64,
        /// J
        #[serde(rename = "capacity.remaining")]
        capacity_remaining: f64,
        voltage: f64,
        current: f64,
        /// Seconds until empty at the present current. Absent when the state of
        /// charge is unknown.
        #[serde(rename = "capacity.timeRemaining", skip_serializing_if = "Option::is_none")]
        time_remaining: Option<u64>,
    },
    Volt {
        voltage: f64,
    },
    Ohm {
        ohm: u16,
    },
    Current {
        current: f64,
    },
    Tank {
        /// 0-1
        #[serde(rename = "currentLevel")]
        current_level: f64,
        /// m3
        #[serde(rename = "currentVolume")]
        current_volume: f64,
    },
}

impl Reading {
    /// Compute the reading of `sensor` from a telemetry frame.
    ///
    /// Returns `None` for sensors without readings and for sensors whose
    /// fields the device marked as empty.
    pub fn read(sensor: &Sensor, fields: &Fields) -> Result<Option<Self>> {
        let at = |offset: usize| element(sensor, fields, offset);

        let reading = match &sensor.kind {
            SensorKind::Barometer { .. } => {
                let Some((_, raw)) = at(0)? else { return Ok(None) };
                Reading::Barometer { pressure: u32::from(raw) + 65536 }
            }
            SensorKind::Thermometer { .. } => {
                let Some((_, raw)) = at(0)? else { return Ok(None) };
                Reading::Thermometer { temperature: to_kelvin(raw) }
            }
            SensorKind::Battery { nominal_capacity, .. } => {
                let (Some((raw_soc, _)), Some((_, raw_current)), Some((_, raw_voltage))) =
                    (at(0)?, at(1)?, at(2)?)
                else {
                    return Ok(None);
                };
                let state_of_charge = round2(f64::from(raw_soc) / 16000.0);
                let current = to_current(raw_current);
                let time_remaining = (raw_soc != SOC_UNKNOWN)
                    .then(|| estimate_time_remaining(*nominal_capacity, current, state_of_charge));
                Reading::Battery {
                    state_of_charge,
                    capacity_remaining: nominal_capacity * state_of_charge,
                    voltage: f64::from(raw_voltage) / 1000.0,
                    current,
                    time_remaining,
                }
            }
            SensorKind::Volt { .. } => {
                let Some((_, raw)) = at(0)? else { return Ok(None) };
                Reading::Volt { voltage: f64::from(raw) / 1000.0 }
            }
            SensorKind::Ohm { .. } => {
                let Some((_, raw)) = at(0)? else { return Ok(None) };
                Reading::Ohm { ohm: raw }
            }
            SensorKind::Current { .. } => {
                let Some((_, raw)) = at(0)? else { return Ok(None) };
                Reading::Current { current: to_current(raw) }
            }
            SensorKind::Tank { .. } => {
                let Some((level, volume)) = at(0)? else { return Ok(None) };
                Reading::Tank {
                    current_level: f64::from(level) / 1000.0,
                    current_volume: f64::from(volume) / 10000.0,
                }
            }
            SensorKind::Null | SensorKind::Reserved | SensorKind::Unknown { .. } => {
                return Ok(None)
            }
        };
        Ok(Some(reading))
    }
}

fn element(sensor: &Sensor, fields: &Fields, offset: usize) -> Result<Option<(u16, u16)>> {
    let number = sensor.pos + offset;
    match fields.get(number) {
        Some(FieldValue::Pair(a, b)) => Ok(Some((*a, *b))),
        Some(FieldValue::Empty) => Ok(None),
        Some(FieldValue::Text(_)) => Err(Error::MalformedFrame(format!(
            "field {number} of sensor {} holds text",
            sensor.id
        ))),
        None => Err(Error::MalformedFrame(format!(
            "no field {number} for sensor {}",
            sensor.id
        ))),
    }
}

/// Round to two decimals on the exact binary value, ties to even.
///
/// `0.125` (exact in binary) becomes `0.12`, while `0.015` (stored as
/// 0.01499...) becomes `0.01`, as a C `printf("%.2f")` would print them.
fn round2(value: f64) -> f64 {
    if !value.is_finite() || value == 0.0 {
        return value;
    }
    let bits = value.abs().to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i32;
    let fraction = bits & ((1 << 52) - 1);
    // value.abs() == mantissa * 2^shift exactly
    let (mantissa, shift) = if exponent == 0 {
        (fraction, -1074)
    } else {
        (fraction | (1 << 52), exponent - 1075)
    };
    if shift >= 0 {
        return value;
    }

    let scaled = u128::from(mantissa) * 100;
    let shift = shift.unsigned_abs();
    let hundredths = if shift >= 128 {
        0
    } else {
        let whole = scaled >> shift;
        let rest = scaled & ((1u128 << shift) - 1);
        let half = 1u128 << (shift - 1);
        if rest > half || (rest == half && whole % 2 == 1) {
            whole + 1
        } else {
            whole
        }
    };
    (hundredths as f64 / 100.0).copysign(value)
}

/// Tenths of a degree Celsius, as a wrapped signed value, to Kelvin.
fn to_kelvin(raw: u16) -> f64 {
    let raw = i32::from(raw);
    let signed = if raw > 32768 { raw - 65536 } else { raw };
    round2(f64::from(signed) / 10.0 + 273.15)
}

/// Hundredths of an amp to amps; positive when charging.
fn to_current(raw: u16) -> f64 {
    if raw > CURRENT_DIRECTION_THRESHOLD {
        f64::from(65535 - raw) / 100.0
    } else {
        -(f64::from(raw) / 100.0)
    }
}

fn estimate_time_remaining(nominal_capacity: f64, current: f64, state_of_charge: f64) -> u64 {
    let estimate = (nominal_capacity / 12.0 / (current * state_of_charge + 0.001)).round();
    if estimate.is_finite() && estimate >= 0.0 {
        estimate as u64
    } else {
        TIME_REMAINING_UNKNOWN_S
    }
}

/// The readings of all sensors for one telemetry frame, keyed by sensor id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<u16, Reading>);

impl Snapshot {
    pub fn get(&self, id: u16) -> Option<&Reading> {
        self.0.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Reading)> {
        self.0.iter().map(|(id, reading)| (*id, reading))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Compute the readings of every registered sensor from one telemetry frame.
///
/// Fails as a whole if any sensor's fields are missing from the frame, so a
/// frame that does not match the registry never yields partial readings.
pub fn interpret(fields: &Fields, registry: &SensorRegistry) -> Result<Snapshot> {
    let mut readings = BTreeMap::new();
    for sensor in registry.iter() {
        if let Some(reading) = Reading::read(sensor, fields)? {
            readings.insert(sensor.id, reading);
        }
    }
    Ok(Snapshot(readings))
}

#[cfg(test)]
fn registry(config: Vec<Fields>) -> SensorRegistry {
    SensorRegistry::build(&config).unwrap()
}

#[cfg(test)]
fn telemetry(pairs: &[(u16, u16)]) -> Fields {
    pairs
        .iter()
        .enumerate()
        .map(|(number, &(a, b))| crate::frame::Field::compact(number as u8, a, b))
        .collect()
}

#[test]
fn test_temperature() {
    assert_eq!(to_kelvin(0), 273.15);
    assert_eq!(to_kelvin(65535), 273.05);
    assert_eq!(to_kelvin(50), 278.15);
    assert_eq!(to_kelvin(65336), 253.15);
}

#[test]
fn test_state_of_charge_rounding() {
    let soc = |raw: u16| round2(f64::from(raw) / 16000.0);
    assert_eq!(soc(2000), 0.12);
    assert_eq!(soc(10000), 0.62);
    assert_eq!(soc(6000), 0.38);
    assert_eq!(soc(240), 0.01);
    assert_eq!(soc(720), 0.04);
    assert_eq!(soc(8000), 0.5);
    assert_eq!(soc(16000), 1.0);
    assert_eq!(soc(0), 0.0);
    assert_eq!(round2(-0.125), -0.12);
}

#[test]
fn test_current_direction() {
    assert_eq!(to_current(30000), 355.35);
    assert_eq!(to_current(1000), -10.0);
    assert_eq!(to_current(25000), -250.0);
    assert_eq!(to_current(65535), 0.0);
}

#[test]
fn test_thermometer_end_to_end() {
    let registry = registry(vec![crate::sensor::descriptor(5, 3, Some("Engine Room"))]);
    let snapshot = interpret(&telemetry(&[(0, 50)]), &registry).unwrap();
    assert_eq!(snapshot.get(5), Some(&Reading::Thermometer { temperature: 278.15 }));
    assert_eq!(serde_json::to_string(&snapshot).unwrap(), r#"{"5":{"temperature":278.15}}"#);
}

#[test]
fn test_tank_scaling() {
    let mut tank = crate::sensor::descriptor(3, 8, Some("Water"));
    tank.insert(6, FieldValue::Pair(0, 1));
    tank.insert(7, FieldValue::Pair(0, 1000));
    let registry = registry(vec![crate::sensor::descriptor(1, 3, None), tank]);
    let snapshot = interpret(&telemetry(&[(0, 0), (500, 25000)]), &registry).unwrap();
    assert_eq!(
        snapshot.get(3),
        Some(&Reading::Tank { current_level: 0.5, current_volume: 2.5 })
    );
}

#[test]
fn test_battery() {
    let mut battery = crate::sensor::descriptor(9, 9, Some("House"));
    battery.insert(5, FieldValue::Pair(0, 100));
    let registry = registry(vec![battery]);

    let charging = telemetry(&[(8000, 0), (0, 30000), (0, 12800), (0, 0), (0, 0)]);
    let snapshot = interpret(&charging, &registry).unwrap();
    assert_eq!(
        snapshot.get(9),
        Some(&Reading::Battery {
            state_of_charge: 0.5,
            capacity_remaining: 21600.0,
            voltage: 12.8,
            current: 355.35,
            time_remaining: Some(20),
        })
    );

    let discharging = telemetry(&[(8000, 0), (0, 1000), (0, 12800), (0, 0), (0, 0)]);
    match interpret(&discharging, &registry).unwrap().get(9) {
        Some(Reading::Battery { current, time_remaining, .. }) => {
            assert_eq!(*current, -10.0);
            assert_eq!(*time_remaining, Some(TIME_REMAINING_UNKNOWN_S));
        }
        other => panic!("unexpected reading {other:?}"),
    }

    let unknown = telemetry(&[(SOC_UNKNOWN, 0), (0, 1000), (0, 12800), (0, 0), (0, 0)]);
    match interpret(&unknown, &registry).unwrap().get(9) {
        Some(Reading::Battery { time_remaining, .. }) => assert_eq!(*time_remaining, None),
        other => panic!("unexpected reading {other:?}"),
    }
}

#[test]
fn test_volt_ohm_current_barometer() {
    let registry = registry(vec![
        crate::sensor::descriptor(1, 1, Some("Starter")),
        crate::sensor::descriptor(2, 6, Some("Rudder")),
        crate::sensor::descriptor(3, 2, Some("Solar")),
        crate::sensor::descriptor(4, 5, Some("Baro")),
    ]);
    let frame = telemetry(&[(0, 12650), (0, 180), (0, 64535), (0, 0), (1, 35000), (0, 0)]);
    let snapshot = interpret(&frame, &registry).unwrap();
    assert_eq!(snapshot.get(1), Some(&Reading::Volt { voltage: 12.65 }));
    assert_eq!(snapshot.get(2), Some(&Reading::Ohm { ohm: 180 }));
    assert_eq!(snapshot.get(3), Some(&Reading::Current { current: 10.0 }));
    assert_eq!(snapshot.get(4), Some(&Reading::Barometer { pressure: 100536 }));
}

#[test]
fn test_current_reads_its_own_field() {
    let registry = registry(vec![crate::sensor::descriptor(7, 2, Some("Alternator"))]);
    let snapshot = interpret(&telemetry(&[(0, 1000), (0, 0)]), &registry).unwrap();
    assert_eq!(snapshot.get(7), Some(&Reading::Current { current: -10.0 }));
}

#[test]
fn test_battery_state_of_charge_ties_to_even() {
    let mut battery = crate::sensor::descriptor(9, 9, Some("House"));
    battery.insert(5, FieldValue::Pair(0, 100));
    let registry = registry(vec![battery]);
    let frame = telemetry(&[(2000, 0), (0, 30000), (0, 12800), (0, 0), (0, 0)]);
    match interpret(&frame, &registry).unwrap().get(9) {
        Some(Reading::Battery { state_of_charge, capacity_remaining, .. }) => {
            assert_eq!(*state_of_charge, 0.12);
            assert_eq!(*capacity_remaining, 43200.0 * 0.12);
        }
        other => panic!("unexpected reading {other:?}"),
    }
}

#[test]
fn test_sensors_without_readings_are_skipped() {
    let registry = registry(vec![
        crate::sensor::descriptor(1, 0, None),
        crate::sensor::descriptor(2, 14, None),
        crate::sensor::descriptor(3, 3, None),
    ]);
    let snapshot = interpret(&telemetry(&[(0, 0), (0, 0)]), &registry).unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get(3), Some(&Reading::Thermometer { temperature: 273.15 }));
}

#[test]
fn test_empty_field_skips_sensor() {
    let registry = registry(vec![crate::sensor::descriptor(3, 3, None)]);
    let mut frame = Fields::new();
    frame.insert(0, FieldValue::Empty);
    assert!(interpret(&frame, &registry).unwrap().is_empty());
}

#[test]
fn test_frame_shorter_than_layout() {
    let registry = registry(vec![
        crate::sensor::descriptor(1, 3, None),
        crate::sensor::descriptor(2, 3, None),
    ]);
    assert!(matches!(
        interpret(&telemetry(&[(0, 0)]), &registry),
        Err(Error::MalformedFrame(_))
    ));
}
