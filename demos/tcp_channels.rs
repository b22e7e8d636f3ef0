//! Example demonstrating message channels over TCP.
//!
//! Run the server in one terminal and the client in another:
//!
//! ```text
//! cargo run --example tcp_channels -- server
//! cargo run --example tcp_channels -- client
//! ```

use msgchan::{
    CancellationToken, MessageChannel, StandardCodec, StringCodec, TcpConfig, TcpMessenger,
    TcpMessengerListener, Value,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;

const ADDR: &str = "127.0.0.1:7878";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("msgchan=info")
        .init();

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("server");

    match mode {
        "server" => run_server().await?,
        "client" => run_client().await?,
        _ => {
            eprintln!("Usage: cargo run --example tcp_channels -- [server|client]");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    println!("[Server] Listening on {}", ADDR);

    let listener = TcpMessengerListener::bind(ADDR.parse()?, TcpConfig::default()).await?;
    let messenger = Arc::new(listener.accept().await?);
    println!("[Server] Peer connected: {}", messenger.peer_addr());

    let shutdown = CancellationToken::new();

    // Structured values on one channel
    let adder = MessageChannel::new(messenger.clone(), "calc/add", StandardCodec);
    adder.set_message_handler_fn(|channel, message: Value, reply| async move {
        let a = message.lookup("a").and_then(Value::as_int).unwrap_or(0);
        let b = message.lookup("b").and_then(Value::as_int).unwrap_or(0);
        println!("[Server] add({}, {})", a, b);
        channel.respond(&reply, Some(&Value::from(a + b))).unwrap();
    });

    // Plain strings on another channel of the same connection
    let echo = MessageChannel::new(messenger.clone(), "echo", StringCodec);
    echo.set_message_handler_fn(|channel, message: String, reply| async move {
        println!("[Server] echo({:?})", message);
        channel.respond(&reply, Some(&message)).unwrap();
    });

    let stop = shutdown.clone();
    let control = MessageChannel::new(messenger.clone(), "control/shutdown", StringCodec);
    control.set_message_handler_fn(move |channel, _message: String, reply| {
        let stop = stop.clone();
        async move {
            println!("[Server] Shutdown requested");
            channel.respond(&reply, Some(&"bye".to_string())).unwrap();
            stop.cancel();
        }
    });

    shutdown.cancelled().await;
    // Let the final reply flush before the connection drops.
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("[Server] Shutting down");
    Ok(())
}

async fn run_client() -> Result<(), Box<dyn std::error::Error>> {
    println!("[Client] Connecting to {}", ADDR);

    let messenger = Arc::new(TcpMessenger::connect(ADDR.parse()?, TcpConfig::default()).await?);
    println!("[Client] Connected\n");

    let adder = MessageChannel::new(messenger.clone(), "calc/add", StandardCodec);
    let request = Value::Map(vec![
        (Value::from("a"), Value::from(10)),
        (Value::from("b"), Value::from(32)),
    ]);
    let reply = adder.send(&request).await?;
    println!("[Client] add -> {:?}\n", reply);

    let echo = MessageChannel::new(messenger.clone(), "echo", StringCodec);
    let reply = echo.send(&"Hello, channels!".to_string()).await?;
    println!("[Client] echo -> {:?}\n", reply);

    // Nobody listens on this name; the send still resolves.
    let missing = MessageChannel::new(messenger.clone(), "no/such/channel", StringCodec);
    let reply = missing.send(&"anyone?".to_string()).await?;
    println!("[Client] unhandled -> {:?}\n", reply);

    let control = MessageChannel::new(messenger.clone(), "control/shutdown", StringCodec);
    let reply = control.send(&"now".to_string()).await?;
    println!("[Client] shutdown -> {:?}", reply);

    println!("[Client] Done!");
    Ok(())
}
