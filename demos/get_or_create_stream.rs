use std::error::Error;

use secrecy::SecretString;
use streamr_client::{Client, ClientOptions};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let api_key = "REPLACE_WITH_API_KEY".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Client::new(ClientOptions::new(SecretString::new(api_key))).await?;
        let stream = client
            .get_or_create_stream("sensor-readings", Some("Temperature readings"))
            .await?;
        println!("stream id={} name={}", stream.id, stream.name);

        match client.get_stream_by_id(&stream.id).await? {
            Some(found) => println!("partitions={:?}", found.partitions),
            None => println!("stream {} not visible yet", stream.id),
        }
        Ok::<(), Box<dyn Error>>(())
    })
}
