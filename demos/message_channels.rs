//! Example demonstrating message channels over an in-process messenger.

use msgchan::{
    BincodeCodec, CancellationToken, LocalConfig, LocalMessenger, MessageChannel, Messenger,
    StandardCodec, StringCodec, Value,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    celsius: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("msgchan=info")
        .init();

    string_channel_example().await?;
    value_channel_example().await?;
    typed_channel_example().await?;
    cancellation_example().await?;
    Ok(())
}

async fn string_channel_example() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- String channel (in-process) ---");

    let (a, b) = LocalMessenger::create_pair("demo", LocalConfig::default());
    let (a, b) = (Arc::new(a), Arc::new(b));

    let greeter = MessageChannel::new(b.clone(), "demo/greet", StringCodec);
    greeter.set_message_handler_fn(|channel, message: String, reply| async move {
        let answer = format!("hello, {}", message);
        channel.respond(&reply, Some(&answer)).unwrap();
    });

    let caller = MessageChannel::new(a.clone(), "demo/greet", StringCodec);
    let reply = caller.send(&"world".to_string()).await?;
    println!("Reply: {:?}", reply);

    // A name nobody listens on still resolves, with no content.
    let silent = MessageChannel::new(a.clone(), "demo/silent", StringCodec);
    let reply = silent.send(&"anyone?".to_string()).await?;
    println!("Unhandled name replied: {:?}", reply);

    let stats = a.stats().unwrap();
    println!(
        "Stats: sent={}, received={}",
        stats.messages_sent, stats.messages_received
    );

    println!();
    Ok(())
}

async fn value_channel_example() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Structured value channel ---");

    let (a, b) = LocalMessenger::create_pair("values", LocalConfig::default());
    let (a, b) = (Arc::new(a), Arc::new(b));

    let service = MessageChannel::new(b.clone(), "sensors/query", StandardCodec);
    service.set_message_handler_fn(|channel, message: Value, reply| async move {
        println!("[Service] request: {:?}", message);
        let station = message
            .lookup("station")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let answer = Value::Map(vec![
            (Value::from("station"), Value::from(station)),
            (Value::from("celsius"), Value::from(21.5)),
            (Value::from("ok"), Value::from(true)),
        ]);
        channel.respond(&reply, Some(&answer)).unwrap();
    });

    let client = MessageChannel::new(a.clone(), "sensors/query", StandardCodec);
    let request = Value::Map(vec![(Value::from("station"), Value::from("rooftop"))]);
    let reply = client.send(&request).await?;
    println!("[Client] reply: {:?}", reply);

    println!();
    Ok(())
}

async fn typed_channel_example() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Typed channel (bincode) ---");

    let (a, b) = LocalMessenger::create_pair("typed", LocalConfig::default());
    let (a, b) = (Arc::new(a), Arc::new(b));

    let ingest = MessageChannel::new(b.clone(), "sensors/ingest", BincodeCodec::<Reading>::new());
    ingest.set_message_handler_fn(|channel, reading: Reading, reply| async move {
        println!("[Ingest] {} at {:.1} C", reading.sensor, reading.celsius);
        channel.respond(&reply, Some(&reading)).unwrap();
    });

    let probe = MessageChannel::new(a.clone(), "sensors/ingest", BincodeCodec::<Reading>::new());
    let reading = Reading {
        sensor: "rooftop".to_string(),
        celsius: 21.5,
    };
    let echoed = probe.send(&reading).await?;
    assert_eq!(echoed, Some(reading));
    println!("[Probe] acknowledged");

    println!();
    Ok(())
}

async fn cancellation_example() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Cancellation ---");

    let (a, b) = LocalMessenger::create_pair("cancel", LocalConfig::default());
    let (a, b) = (Arc::new(a), Arc::new(b));

    let slow = MessageChannel::new(b.clone(), "demo/slow", StringCodec);
    slow.set_message_handler_fn(|channel, _message: String, reply| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let _ = channel.respond(&reply, Some(&"too late".to_string()));
    });

    let caller = MessageChannel::new(a.clone(), "demo/slow", StringCodec);
    let cancel = CancellationToken::new();

    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
    });

    match caller
        .send_with_cancellation(&"take your time".to_string(), &cancel)
        .await
    {
        Ok(reply) => println!("Reply: {:?}", reply),
        Err(e) => println!("Send settled with: {}", e),
    }

    Ok(())
}
