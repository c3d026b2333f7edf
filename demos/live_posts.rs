//! Subscribe to the `posts` collection and print changes as they arrive.
//!
//! ```sh
//! PULSEBASE_URL=http://127.0.0.1:8090 cargo run --example live_posts
//! ```

use anyhow::Result;
use pulsebase_realtime::{Event, RealtimeClient, RealtimeError};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let base = std::env::var("PULSEBASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8090".into());
    let client = RealtimeClient::new(&base)?;

    let _posts = client
        .subscribe(["posts"], |msg: Result<Event, RealtimeError>| match msg {
            Ok(event) => println!("{} {}: {}", event.action, event.topic, event.payload),
            Err(err) => eprintln!("stream fault: {err}"),
        })
        .await?;

    println!("listening for changes on 'posts' (ctrl-c to quit)");
    tokio::signal::ctrl_c().await?;
    client.close().await;
    Ok(())
}
