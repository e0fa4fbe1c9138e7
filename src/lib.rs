//! Read sensor data from Simarine Pico battery and tank monitors over the local network
//!
//! The Pico speaks a proprietary binary protocol which I have partially reverse engineered.
//! It is used in two places:
//!
//! - A request-response config service on TCP port 5001. Asking it first for the number of
//!   sensor slots and then for each slot's descriptor tells us which sensors exist.
//! - A telemetry broadcast on UDP port 43210, roughly once per second. Each frame is a flat
//!   list of values with no sensor ids; the config tells us which values belong to which sensor.
//!
//! Both use the same framing: a 14 byte header, tagged fields, and a CRC-16.
//!
//! Currently the following readings are decoded:
//!
//! - Temperature (K)
//! - Battery state of charge, remaining capacity (J), voltage (V), current (A) and
//!   estimated time remaining (s)
//! - Voltage (V), current (A) and resistance (ohm)
//! - Tank level and volume
//! - Barometric pressure (Pa)
//!
//! # Example
//!
//! ```no_run
//! # use std::time::Duration;
//! # #[tokio::main]
//! # pub async fn main() -> picoread::Result<()> {
//!     let listener = picoread::TelemetryListener::bind(picoread::DEFAULT_LISTEN_PORT).await?;
//!     let device = listener.discover().await?;
//!
//!     let mut client = picoread::PicoClient::connect(device, &Default::default()).await?;
//!     let config = client.fetch_config().await?;
//!     client.stop().await?;
//!
//!     let mut session = picoread::Session::new(picoread::SensorRegistry::build(&config)?);
//!     loop {
//!         let frame = listener.next_frame().await?;
//!         match session.process(&frame) {
//!             Ok(snapshot) => println!("{snapshot:?}"),
//!             Err(err) => eprintln!("skipping frame: {err}"),
//!         }
//!         tokio::time::sleep(Duration::from_millis(900)).await;
//!     }
//! # }
//! ```

pub mod config;
pub mod crc;
mod error;
pub mod frame;
mod listener;
mod message;
mod pico_client;
mod reading;
mod sensor;
mod session;

pub use config::{ClientConfig, RetryPolicy, DEFAULT_CONFIG_PORT, DEFAULT_LISTEN_PORT};
pub use error::{Error, Result};
pub use frame::{Field, FieldType, FieldValue, Fields};
pub use listener::{is_telemetry_len, TelemetryListener, MAX_FRAME_LEN, MIN_FRAME_LEN};
pub use pico_client::{connect_with_retry, PicoClient};
pub use reading::{interpret, Reading, Snapshot};
pub use sensor::{FluidKind, Sensor, SensorKind, SensorRegistry};
pub use session::{Report, Session};
