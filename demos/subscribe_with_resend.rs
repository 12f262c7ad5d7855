use std::error::Error;

use secrecy::SecretString;
use serde_json::Value;
use streamr_client::{
    Client, ClientEvent, ClientOptions, ResendOptions, StreamMessage, SubscribeOptions,
    SubscriptionEvent,
};
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

        let handle = client.subscribe(
            &stream_id,
            |content: &Value, message: &StreamMessage| {
                println!("offset={} content={content}", message.offset);
            },
            SubscribeOptions::default().with_resend(ResendOptions::last(10)),
        )?;
        println!("subscription {} on {}", handle.id(), handle.stream_id());

        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Subscription { event, .. } => match event {
                    SubscriptionEvent::Gap { from, to } => {
                        println!("gap {from}..={to}, resend requested")
                    }
                    SubscriptionEvent::Done => break,
                    other => println!("subscription: {other:?}"),
                },
                ClientEvent::ConnectionLost {
                    reconnecting: false,
                    ..
                } => break,
                other => println!("{other:?}"),
            }
        }
        Ok::<(), Box<dyn Error>>(())
    })
}
