use std::error::Error;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use streamr_client::{Client, ClientEvent, ClientOptions};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api_key = "REPLACE_WITH_API_KEY".to_string();
    let stream_id = "REPLACE_WITH_STREAM_ID".to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Client::new(ClientOptions::new(SecretString::new(api_key))).await?;
        let mut events = client.events();

        // Queued until the socket opens.
        for reading in 0..5 {
            client.publish(
                &stream_id,
                &json!({ "temperature": 20 + reading, "unit": "C" }),
                None,
            )?;
        }

        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connected => {
                    println!("connected, queued messages flushed");
                    break;
                }
                ClientEvent::ConnectionLost {
                    reconnecting: false,
                    attempt,
                } => {
                    eprintln!("gave up after {attempt} attempts");
                    return Ok(());
                }
                other => println!("{other:?}"),
            }
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        client.disconnect()?;
        Ok::<(), Box<dyn Error>>(())
    })
}
