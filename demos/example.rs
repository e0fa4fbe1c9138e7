use std::time::Duration;

#[tokio::main]
pub async fn main() -> picoread::Result<()> {
    let listener = picoread::TelemetryListener::bind(picoread::DEFAULT_LISTEN_PORT).await?;
    let device = listener.discover().await?;

    let mut client = picoread::PicoClient::connect(device, &Default::default()).await?;
    let config = client.fetch_config().await?;
    client.stop().await?;

    let mut session = picoread::Session::new(picoread::SensorRegistry::build(&config)?);
    loop {
        let frame = listener.next_frame().await?;
        if let Ok(snapshot) = session.process(&frame) {
            for (id, reading) in snapshot.iter() {
                println!("{id}: {reading:?}");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        listener.drain();
    }
}
