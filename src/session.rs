use futures_util::{pin_mut, Stream, StreamExt};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tracing::{trace, warn};

use crate::error::Result;
use crate::frame::{self, Fields};
use crate::reading::{interpret, Reading, Snapshot};
use crate::sensor::{Sensor, SensorRegistry};

/// State kept across telemetry cycles. Created once the config has been
/// read; the registry never changes afterwards.
#[derive(Debug)]
pub struct Session {
    registry: SensorRegistry,
    last_frame: Option<Fields>,
    last_snapshot: Option<Snapshot>,
}

impl Session {
    pub fn new(registry: SensorRegistry) -> Self {
        Self { registry, last_frame: None, last_snapshot: None }
    }

    pub fn registry(&self) -> &SensorRegistry {
        &self.registry
    }

    /// Readings of the last frame that decoded cleanly
    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    /// Decode and interpret one telemetry frame.
    ///
    /// On failure the previous frame and snapshot are kept as they were.
    pub fn process(&mut self, datagram: &[u8]) -> Result<&Snapshot> {
        let fields = frame::parse(datagram)?;
        let snapshot = interpret(&fields, &self.registry)?;

        if let Some(last) = &self.last_frame {
            for number in fields.changed_since(last) {
                trace!(field = number, old = ?last.get(number), new = ?fields.get(number), "field changed");
            }
        }
        self.last_frame = Some(fields);
        Ok(self.last_snapshot.insert(snapshot))
    }

    /// Process frames until the stream ends, handing every cycle's report to
    /// `emit`. Frames that fail to decode are logged and skipped; errors
    /// from the stream itself end the run.
    pub async fn run<St, F>(&mut self, frames: St, mut emit: F) -> Result<()>
    where
        St: Stream<Item = Result<Vec<u8>>>,
        F: FnMut(Report<'_>),
    {
        pin_mut!(frames);
        while let Some(datagram) = frames.next().await {
            let datagram = datagram?;
            if let Err(err) = self.process(&datagram) {
                warn!(%err, len = datagram.len(), frame = %hex::encode(&datagram), "skipping telemetry frame");
                continue;
            }
            if let Some(snapshot) = &self.last_snapshot {
                emit(Report::new(&self.registry, snapshot));
            }
        }
        Ok(())
    }
}

/// One cycle's output: every sensor's static attributes merged with its
/// readings, keyed by sensor id.
#[derive(Debug, Clone, Copy)]
pub struct Report<'a> {
    registry: &'a SensorRegistry,
    snapshot: &'a Snapshot,
}

impl<'a> Report<'a> {
    pub fn new(registry: &'a SensorRegistry, snapshot: &'a Snapshot) -> Self {
        Self { registry, snapshot }
    }

    pub fn snapshot(&self) -> &'a Snapshot {
        self.snapshot
    }
}

#[derive(Serialize)]
struct SensorReport<'a> {
    #[serde(flatten)]
    sensor: &'a Sensor,
    #[serde(flatten)]
    reading: Option<&'a Reading>,
}

impl Serialize for Report<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.registry.len()))?;
        for sensor in self.registry.iter() {
            let report = SensorReport { sensor, reading: self.snapshot.get(sensor.id) };
            map.serialize_entry(&sensor.id, &report)?;
        }
        map.end()
    }
}

#[cfg(test)]
use crate::error::Error;
#[cfg(test)]
use crate::frame::Field;
#[cfg(test)]
use crate::sensor::descriptor;

#[cfg(test)]
const HEADER: [u8; frame::HEADER_LEN] =
    [0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x0a, 0x04, 0x8c, 0x55, 0x4b, 0x00, 0x00, 0xff];

#[cfg(test)]
fn engine_room() -> Session {
    let config = vec![descriptor(5, 3, Some("Engine Room"))];
    Session::new(SensorRegistry::build(&config).unwrap())
}

#[cfg(test)]
fn telemetry(raw: u16) -> Vec<u8> {
    frame::encode(&HEADER, &[Field::compact(0, 0, raw)])
}

#[cfg(test)]
fn broken_telemetry() -> Vec<u8> {
    let mut frame = HEADER.to_vec();
    frame.extend_from_slice(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x32, 0xff]);
    frame
}

#[test]
fn test_process_end_to_end() {
    let mut session = engine_room();
    let snapshot = session.process(&telemetry(50)).unwrap();
    assert_eq!(snapshot.get(5), Some(&Reading::Thermometer { temperature: 278.15 }));
}

#[test]
fn test_failed_frame_keeps_previous_snapshot() {
    let mut session = engine_room();
    session.process(&telemetry(50)).unwrap();
    assert!(matches!(
        session.process(&broken_telemetry()),
        Err(Error::UnknownFieldType { field: 0, field_type: 0x07 })
    ));
    assert_eq!(
        session.last_snapshot().and_then(|s| s.get(5)),
        Some(&Reading::Thermometer { temperature: 278.15 })
    );
}

#[test]
fn test_report_json() {
    let mut session = engine_room();
    session.process(&telemetry(0)).unwrap();
    let snapshot = session.last_snapshot().unwrap();
    let json = serde_json::to_value(Report::new(session.registry(), snapshot)).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "5": { "type": "thermometer", "pos": 0, "name": "Engine Room", "temperature": 273.15 }
        })
    );
}

#[tokio::test]
async fn test_run_skips_bad_cycles() {
    let mut session = engine_room();
    let frames = futures_util::stream::iter(vec![
        Ok(telemetry(50)),
        Ok(broken_telemetry()),
        Ok(telemetry(65535)),
    ]);

    let mut emitted = Vec::new();
    session
        .run(frames, |report| {
            emitted.push(report.snapshot().get(5).cloned());
        })
        .await
        .unwrap();

    assert_eq!(
        emitted,
        vec![
            Some(Reading::Thermometer { temperature: 278.15 }),
            Some(Reading::Thermometer { temperature: 273.05 }),
        ]
    );
}

#[tokio::test]
async fn test_run_stops_on_transport_error() {
    let mut session = engine_room();
    let frames = futures_util::stream::iter(vec![
        Ok(telemetry(50)),
        Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "socket closed"))),
        Ok(telemetry(60)),
    ]);

    let mut cycles = 0;
    let result = session.run(frames, |_| cycles += 1).await;
    assert!(matches!(result, Err(Error::Io(_))));
    assert_eq!(cycles, 1);
}
