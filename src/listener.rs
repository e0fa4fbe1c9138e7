//! The UDP side of the device: it broadcasts telemetry frames to a fixed
//! port, and the first datagram seen there also tells us where it lives.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::Stream;
use tokio::net::UdpSocket;
use tokio::time::sleep;
use tracing::{debug, info, trace};

use crate::error::Result;

/// Datagrams must be strictly longer than this to be telemetry frames
pub const MIN_FRAME_LEN: usize = 100;
/// and strictly shorter than this.
pub const MAX_FRAME_LEN: usize = 1200;

const RECV_BUFFER_LEN: usize = 4096;

/// Whether a datagram of `len` bytes is a telemetry frame.
pub fn is_telemetry_len(len: usize) -> bool {
    len > MIN_FRAME_LEN && len < MAX_FRAME_LEN
}

pub struct TelemetryListener {
    socket: UdpSocket,
}

impl TelemetryListener {
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.set_broadcast(true)?;
        debug!(addr = ?socket.local_addr()?, "listening for telemetry");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for the device to broadcast and return its address.
    pub async fn discover(&self) -> Result<IpAddr> {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let (_, addr) = self.socket.recv_from(&mut buf).await?;
        info!(%addr, "found device");
        Ok(addr.ip())
    }

    /// Wait for the next telemetry frame, dropping anything that is not one.
    pub async fn next_frame(&self) -> Result<Vec<u8>> {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        loop {
            let (len, addr) = self.socket.recv_from(&mut buf).await?;
            if is_telemetry_len(len) {
                debug!(len, %addr, "received telemetry frame");
                return Ok(buf[..len].to_vec());
            }
            debug!(len, %addr, "dropping datagram");
        }
    }

    /// Throw away everything queued on the socket. Returns how many datagrams
    /// were dropped.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let mut dropped = 0;
        while self.socket.try_recv_from(&mut buf).is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Telemetry frames paced at `cadence`: after each frame, wait, then skip
    /// whatever queued up meanwhile so the next frame is fresh.
    pub fn frames(self, cadence: Duration) -> impl Stream<Item = Result<Vec<u8>>> {
        futures_util::stream::unfold((self, false), move |(listener, paced)| async move {
            if paced {
                sleep(cadence).await;
                let dropped = listener.drain();
                trace!(dropped, "drained queued datagrams");
            }
            let frame = listener.next_frame().await;
            Some((frame, (listener, true)))
        })
    }
}

#[test]
fn test_is_telemetry_len() {
    assert!(!is_telemetry_len(0));
    assert!(!is_telemetry_len(100));
    assert!(is_telemetry_len(101));
    assert!(is_telemetry_len(1199));
    assert!(!is_telemetry_len(1200));
}

#[tokio::test]
async fn test_listener_filters_and_discovers() {
    let listener = TelemetryListener::bind(0).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let device = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let target = (Ipv4Addr::LOCALHOST, port);

    device.send_to(&[0u8; 20], target).await.unwrap();
    assert_eq!(listener.discover().await.unwrap(), IpAddr::V4(Ipv4Addr::LOCALHOST));

    device.send_to(&[1u8; 50], target).await.unwrap();
    device.send_to(&[2u8; 1500], target).await.unwrap();
    device.send_to(&[3u8; 150], target).await.unwrap();
    assert_eq!(listener.next_frame().await.unwrap(), vec![3u8; 150]);
}
