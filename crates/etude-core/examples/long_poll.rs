// examples/long_poll.rs
//! Long-polling chat room.
//!
//! ```bash
//! cargo run -p etude-core --example long_poll
//! curl 'localhost:8000/poll' &            # parks until someone posts
//! curl -d 'hi there' localhost:8000/say   # wakes every poller
//! ```
use etude_core::{Args, Config, Context, Continuation, EtudeResult, Response, Server, logging};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Default)]
struct Room {
    waiting: Mutex<Vec<Continuation>>,
}

impl Room {
    fn poll(&self, ctx: &mut Context) -> EtudeResult<Response> {
        self.waiting.lock().push(ctx.continuation.clone());
        match ctx.continuation.suspend(Some(Duration::from_secs(25))) {
            Ok(args) => {
                let text = args.get(0).and_then(|v| v.as_str()).unwrap_or_default();
                Ok(Response::ok(text.to_string()))
            }
            Err(e) if e.is_timeout() => Ok(Response::new(204)),
            Err(e) => Err(e),
        }
    }

    fn say(&self, ctx: &mut Context) -> EtudeResult<Response> {
        let text = String::from_utf8_lossy(&ctx.request.body).into_owned();
        let waiting: Vec<_> = self.waiting.lock().drain(..).collect();
        let mut delivered = 0;
        for c in waiting.iter().filter(|c| c.is_suspended()) {
            if c.resume(Args::new().arg(text.as_str())).is_ok() {
                delivered += 1;
            }
        }
        info!(delivered, "message broadcast");
        Ok(Response::ok(format!("delivered to {delivered}\n")))
    }
}

fn main() -> EtudeResult<()> {
    logging::init_logging();
    let room = Arc::new(Room::default());
    let config = Config::from_env()?;
    Server::from_config(&config)?
        .handle_signals(true)
        .run(move |ctx: &mut Context| match ctx.request.path.as_str() {
            "/poll" => room.poll(ctx),
            "/say" => room.say(ctx),
            _ => Ok(Response::not_found()),
        })
}
