//! A WebSocket echo server built on wsmux.
//!
//! Serves two applications from a single thread:
//! - `/echo` sends every text or binary message back to its sender.
//! - `/broadcast` forwards every message to all connected clients. Clients must offer
//!   the `broadcast` sub-protocol.

use std::{collections::BTreeSet, time::Duration};

use clap::Parser;
use http::HeaderMap;
use wsmux::{
    app::{Application, Context, Message, Route},
    CloseStatus, EventLoop, Options, SessionId,
};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Maximum wait of the readiness loop, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Log every frame, not only connections.
    #[arg(short, long)]
    verbose: bool,
}

struct Echo;

impl Application for Echo {
    fn on_message(&mut self, ctx: &mut Context<'_>, id: SessionId, message: Message) {
        ctx.send(id, message);
    }
}

#[derive(Default)]
struct Broadcast {
    members: BTreeSet<SessionId>,
}

impl Application for Broadcast {
    fn choose_protocol(&self, protocols: &[&str]) -> Option<String> {
        protocols
            .iter()
            .find(|protocol| **protocol == "broadcast")
            .map(|protocol| protocol.to_string())
    }

    fn on_connect(
        &mut self,
        _ctx: &mut Context<'_>,
        id: SessionId,
        _headers: &HeaderMap,
        _protocol: Option<&str>,
    ) {
        log::info!("[{id}] joined, {} members", self.members.len() + 1);
        self.members.insert(id);
    }

    fn on_message(&mut self, ctx: &mut Context<'_>, _id: SessionId, message: Message) {
        for member in &self.members {
            ctx.send(*member, message.clone());
        }
    }

    fn on_disconnect(&mut self, _ctx: &mut Context<'_>, id: SessionId, status: Option<CloseStatus>) {
        self.members.remove(&id);
        match status {
            Some(status) => log::info!("[{id}] left: {status}"),
            None => log::info!("[{id}] left"),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose {
        log::Level::Trace
    } else {
        log::Level::Debug
    };
    simple_logger::init_with_level(level).expect("log");

    let options = Options::default().with_tick(Duration::from_millis(args.tick_ms));
    let mut event_loop = EventLoop::bind(args.addr.as_str(), options).await?;
    event_loop
        .server_mut()
        .add_application(Route::path("/echo"), Echo)?;
    event_loop
        .server_mut()
        .add_application(Route::path("/broadcast"), Broadcast::default())?;

    log::info!("echo server on ws://{}/echo", event_loop.local_addr()?);
    event_loop.run().await;

    Ok(())
}
