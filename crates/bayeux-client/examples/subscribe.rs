//! Connect to a Bayeux server, subscribe a channel, publish a message.
//!
//! ```sh
//! cargo run --example subscribe -- ws://127.0.0.1:8080/bayeux
//! ```

use std::time::Duration;

use bayeux_client::{BayeuxClient, ClientConfig, ReachabilityHandle};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8080/bayeux".to_owned());

    let client = BayeuxClient::new(ClientConfig::new(url), ReachabilityHandle::always_up());
    client.connect().await?;
    println!("connected, clientId = {:?}", client.client_id());

    client
        .subscribe::<serde_json::Value, _>("/chat/demo", |msg| {
            println!("chat: {msg}");
        })
        .await?;

    client.publish("/chat/demo", serde_json::json!({"text": "hello from bayeux-client"}))?;

    tokio::time::sleep(Duration::from_secs(60)).await;
    client.close().await;
    Ok(())
}
