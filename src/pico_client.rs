use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, RetryPolicy};
use crate::crc;
use crate::error::{Error, Result};
use crate::frame::{Fields, LENGTH_END};
use crate::message::count_message::{self, CountMessage};
use crate::message::slot_message::{self, SlotMessage};

/// Config responses are never bigger than this
const READ_BUFFER_LEN: usize = 4096;

/// Talks to the config service of a Pico. One request is in flight at a time.
pub struct PicoClient<S> {
    stream: S,
    request_timeout: Duration,
}

impl PicoClient<TcpStream> {
    /// Open the config connection to the device at `ip`.
    pub async fn connect(ip: IpAddr, config: &ClientConfig) -> Result<Self> {
        let addr = SocketAddr::new(ip, config.port);
        let stream = connect_with_retry(&config.retry, || TcpStream::connect(addr)).await?;
        info!(%addr, "connected to config service");
        Ok(Self::new(stream, config.request_timeout))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PicoClient<S> {
    pub fn new(stream: S, request_timeout: Duration) -> Self {
        Self { stream, request_timeout }
    }

    /// Read the descriptor of every configured sensor slot, indexed by slot.
    pub async fn fetch_config(&mut self) -> Result<Vec<Fields>> {
        let rsp = self.request_response(&count_message::request()).await?;
        let slot_count = CountMessage::new(rsp).slot_count()?;
        debug!(slot_count, "device reports sensor slots");

        let mut config = Vec::with_capacity(slot_count);
        for pos in (0..=u8::MAX).take(slot_count) {
            let rsp = self.request_response(&slot_message::request(pos)).await?;
            let fields = SlotMessage::new(&rsp)?.into_fields();
            debug!(pos, ?fields, "slot descriptor");
            config.push(fields);
        }
        Ok(config)
    }

    /// Close the connection
    pub async fn stop(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn request_response(&mut self, rq: &[u8]) -> Result<Vec<u8>> {
        debug!(tx = %hex::encode(rq), "sending request");
        self.stream.write_all(rq).await?;

        // A request with a bad CRC is silently dropped by the device, so it
        // shows up here as a timeout like any other lost request.
        let rsp = timeout(self.request_timeout, Self::read_message(&mut self.stream))
            .await
            .map_err(|_| Error::Timeout)??;
        debug!(rx = %hex::encode(&rsp), "received response");

        if !crc::verify(&rsp) {
            warn!(rx = %hex::encode(&rsp), "response CRC mismatch, using it anyway");
        }
        Ok(rsp)
    }

    /// Read one whole response. A response may arrive in several pieces, so
    /// keep reading until the length announced in the header is reached.
    async fn read_message(stream: &mut S) -> Result<Vec<u8>> {
        let mut msg = Vec::new();
        let mut buf = [0u8; READ_BUFFER_LEN];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(if msg.is_empty() {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by device").into()
                } else {
                    Error::MalformedFrame(format!(
                        "connection closed after {} bytes: {}",
                        msg.len(),
                        hex::encode(&msg)
                    ))
                });
            }
            msg.extend_from_slice(&buf[..n]);

            match try_parse_msg(&msg) {
                TryParseMessageResult::Complete(len) => {
                    if len < msg.len() {
                        warn!(extra = msg.len() - len, "discarding bytes after response");
                        msg.truncate(len);
                    }
                    return Ok(msg);
                }
                TryParseMessageResult::Incomplete => {}
            }
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
enum TryParseMessageResult {
    /// The message spans this many bytes
    Complete(usize),
    Incomplete,
}

/// Check whether `buffer` holds a whole response.
///
/// Byte | Meaning
/// 0-10 | Header
/// 11-12| Big-endian count of the bytes that follow, CRC included
/// 13-  | Fields, then the CRC
fn try_parse_msg(buffer: &[u8]) -> TryParseMessageResult {
    if buffer.len() < LENGTH_END {
        return TryParseMessageResult::Incomplete;
    }
    let expected_len = LENGTH_END + usize::from(u16::from_be_bytes([buffer[11], buffer[12]]));
    if buffer.len() < expected_len {
        TryParseMessageResult::Incomplete
    } else {
        TryParseMessageResult::Complete(expected_len)
    }
}

/// Run `connect` until it succeeds or `policy` gives up, pausing between
/// attempts.
pub async fn connect_with_retry<T, F, Fut>(policy: &RetryPolicy, mut connect: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match timeout(policy.attempt_timeout, connect()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        };
        match result {
            Ok(connection) => return Ok(connection),
            Err(err) if attempt < max_attempts => {
                warn!(attempt, %err, delay = ?policy.delay, "connection attempt failed, retrying");
                sleep(policy.delay).await;
            }
            Err(err) => {
                warn!(attempt, %err, "giving up connecting");
                return Err(Error::ConnectionFailure { attempts: attempt, source: err });
            }
        }
    }
}

#[cfg(test)]
use crate::frame::{self, Field};
#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};
#[cfg(test)]
use tokio::io::DuplexStream;
#[cfg(test)]
use tokio::time::Instant;

#[cfg(test)]
const COUNT_RESPONSE: &str = "0000000000ff02048c554b0011ff01010000001eff020100000030ff32cf";

/// Answer config requests like a device with the given slot descriptors.
#[cfg(test)]
async fn fake_device(mut stream: DuplexStream, slots: Vec<Vec<Field>>) {
    let mut buf = [0u8; 64];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
        let rsp = match buf[6] {
            0x02 => {
                let last = u16::try_from(slots.len() - 1).unwrap();
                frame::message(0x02, &[Field::compact(1, 0, last), Field::compact(2, 0, 48)])
            }
            _ => frame::message(0x41, &slots[usize::from(buf[19])]),
        };
        // Deliver in two pieces to exercise reassembly
        let (head, tail) = rsp.split_at(rsp.len() / 2);
        stream.write_all(head).await.unwrap();
        stream.flush().await.unwrap();
        tokio::task::yield_now().await;
        stream.write_all(tail).await.unwrap();
    }
}

#[test]
fn test_try_parse_message_happy() {
    let message = hex::decode(COUNT_RESPONSE).unwrap();
    assert_eq!(try_parse_msg(&message), TryParseMessageResult::Complete(30));
}

#[test]
fn test_try_parse_message_no_header() {
    let message = hex::decode("0000000000ff02").unwrap();
    assert_eq!(try_parse_msg(&message), TryParseMessageResult::Incomplete);
}

#[test]
fn test_try_parse_message_incomplete() {
    let message = hex::decode(&COUNT_RESPONSE[..40]).unwrap();
    assert_eq!(try_parse_msg(&message), TryParseMessageResult::Incomplete);
}

#[test]
fn test_try_parse_message_too_long() {
    let mut message = hex::decode(COUNT_RESPONSE).unwrap();
    message.extend_from_slice(&[0x00, 0x00]);
    assert_eq!(try_parse_msg(&message), TryParseMessageResult::Complete(30));
}

#[tokio::test]
async fn test_fetch_config() {
    let (client_end, device_end) = tokio::io::duplex(1024);
    let slots = vec![
        vec![Field::compact(0, 0, 5), Field::compact(1, 0, 3), Field::text(3, "Engine Room")],
        vec![Field::compact(0, 0, 6), Field::compact(1, 0, 0)],
    ];
    tokio::spawn(fake_device(device_end, slots));

    let mut client = PicoClient::new(client_end, Duration::from_secs(1));
    let config = client.fetch_config().await.unwrap();
    assert_eq!(config.len(), 2);
    assert_eq!(config[0].pair(0), Some((0, 5)));
    assert_eq!(config[0].text(3), Some("Engine Room"));
    assert_eq!(config[1].pair(1), Some((0, 0)));
    client.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_times_out() {
    let (client_end, _device_end) = tokio::io::duplex(1024);
    let mut client = PicoClient::new(client_end, Duration::from_secs(10));
    assert!(matches!(client.fetch_config().await, Err(Error::Timeout)));
}

#[tokio::test]
async fn test_device_hangs_up() {
    let (client_end, device_end) = tokio::io::duplex(1024);
    drop(device_end);
    let mut client = PicoClient::new(client_end, Duration::from_secs(1));
    assert!(client.fetch_config().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_after_max_attempts() {
    let attempts = AtomicU32::new(0);
    let policy = RetryPolicy::default();
    let started = Instant::now();

    let result: Result<()> = connect_with_retry(&policy, || {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")) }
    })
    .await;

    match result {
        Err(Error::ConnectionFailure { attempts: 5, .. }) => {}
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_failures() {
    let attempts = AtomicU32::new(0);
    let policy = RetryPolicy { delay: Duration::from_secs(1), ..RetryPolicy::default() };

    let result = connect_with_retry(&policy, || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 2 {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            } else {
                Ok(attempt)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_times_out_hanging_attempts() {
    let policy = RetryPolicy {
        max_attempts: 2,
        delay: Duration::from_secs(1),
        attempt_timeout: Duration::from_secs(3),
    };
    let started = Instant::now();

    let result: Result<()> =
        connect_with_retry(&policy, || std::future::pending::<io::Result<()>>()).await;

    match result {
        Err(Error::ConnectionFailure { attempts: 2, source }) => {
            assert_eq!(source.kind(), io::ErrorKind::TimedOut)
        }
        other => panic!("unexpected result {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8));
}
