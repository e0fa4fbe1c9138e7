use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use futures_util::StreamExt;
use picoread::frame::{self, Field};
use picoread::{ClientConfig, PicoClient, Reading, SensorRegistry, Session, TelemetryListener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

const TELEMETRY_HEADER: [u8; frame::HEADER_LEN] =
    [0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x0a, 0x04, 0x8c, 0x55, 0x4b, 0x00, 0x00, 0xff];

fn slots() -> Vec<Vec<Field>> {
    vec![
        vec![Field::compact(0, 0, 5), Field::compact(1, 0, 3), Field::text(3, "Engine Room")],
        vec![
            Field::compact(0, 0, 9),
            Field::compact(1, 0, 9),
            Field::text(3, "House"),
            Field::extended(5, Some((0, 100))),
        ],
        vec![
            Field::compact(0, 0, 3),
            Field::compact(1, 0, 8),
            Field::text(3, "Fresh"),
            Field::extended(4, None),
            Field::compact(6, 0, 1),
            Field::compact(7, 0, 1000),
        ],
        vec![Field::compact(0, 0, 0), Field::compact(1, 0, 0)],
    ]
}

/// Serve one config session the way a Pico does.
async fn serve_config(listener: TcpListener, slots: Vec<Vec<Field>>) {
    let (mut stream, _) = listener.accept().await.unwrap();
    loop {
        let mut head = [0u8; 13];
        if stream.read_exact(&mut head).await.is_err() {
            return;
        }
        let mut rest = vec![0u8; usize::from(u16::from_be_bytes([head[11], head[12]]))];
        stream.read_exact(&mut rest).await.unwrap();

        let rsp = match head[6] {
            0x02 => {
                let last = u16::try_from(slots.len() - 1).unwrap();
                frame::message(0x02, &[Field::compact(1, 0, last), Field::compact(2, 0, 48)])
            }
            _ => frame::message(0x41, &slots[usize::from(rest[6])]),
        };
        stream.write_all(&rsp).await.unwrap();
    }
}

fn telemetry_frame(battery_current: u16) -> Vec<u8> {
    let mut values = vec![(0u16, 0u16); 15];
    values[0] = (0, 50);
    values[1] = (8000, 0);
    values[2] = (0, battery_current);
    values[3] = (0, 12800);
    values[6] = (500, 25000);
    let fields: Vec<Field> = values
        .into_iter()
        .enumerate()
        .map(|(number, (a, b))| Field::compact(number as u8, a, b))
        .collect();
    let mut frame = frame::encode(&TELEMETRY_HEADER, &fields);
    picoread::crc::append(&mut frame);
    frame
}

#[tokio::test]
async fn test_config_then_telemetry() {
    let tcp = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = tcp.local_addr().unwrap().port();
    tokio::spawn(serve_config(tcp, slots()));

    let config = ClientConfig { port, request_timeout: Duration::from_secs(5), ..Default::default() };
    let mut client = PicoClient::connect(IpAddr::V4(Ipv4Addr::LOCALHOST), &config).await.unwrap();
    let descriptors = client.fetch_config().await.unwrap();
    client.stop().await.unwrap();
    assert_eq!(descriptors.len(), 4);

    let registry = SensorRegistry::build(&descriptors).unwrap();
    assert_eq!(registry.len(), 4);
    assert_eq!(registry.get(3).unwrap().pos, 6);
    assert_eq!(registry.element_count(), 7);

    let listener = TelemetryListener::bind(0).await.unwrap();
    let udp_port = listener.local_addr().unwrap().port();
    let device = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    device.send_to(&[0u8; 12], (Ipv4Addr::LOCALHOST, udp_port)).await.unwrap();
    device.send_to(&telemetry_frame(30000), (Ipv4Addr::LOCALHOST, udp_port)).await.unwrap();

    let mut session = Session::new(registry);
    let frames = listener.frames(Duration::from_millis(10)).take(1);
    let mut reports = Vec::new();
    session
        .run(frames, |report| reports.push(serde_json::to_value(report).unwrap()))
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report["5"]["temperature"], 278.15);
    assert_eq!(report["5"]["name"], "Engine Room");
    assert_eq!(report["9"]["type"], "battery");
    assert_eq!(report["9"]["capacity.nominal"], 43200.0);
    assert_eq!(report["9"]["stateOfCharge"], 0.5);
    assert_eq!(report["9"]["current"], 355.35);
    assert_eq!(report["9"]["capacity.timeRemaining"], 20);
    assert_eq!(report["3"]["currentLevel"], 0.5);
    assert_eq!(report["3"]["currentVolume"], 2.5);
    assert_eq!(report["3"]["fluid"], "freshWater");
    assert_eq!(report["0"]["type"], "null");

    assert_eq!(
        session.last_snapshot().unwrap().get(5),
        Some(&Reading::Thermometer { temperature: 278.15 })
    );
}
