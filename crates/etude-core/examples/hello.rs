// examples/hello.rs
use etude_core::{Config, Context, EtudeResult, Response, Server, logging};
use std::time::Duration;

fn hello(ctx: &mut Context) -> EtudeResult<Response> {
    match ctx.request.path.as_str() {
        "/" => Ok(Response::ok("Hello world!")),
        "/sleep" => {
            // Parks this request only; other connections keep being served.
            match ctx.continuation.suspend(Some(Duration::from_secs(1))) {
                Err(e) if e.is_timeout() => Ok(Response::ok("slept 1s")),
                Err(e) => Err(e),
                Ok(_) => Ok(Response::ok("woken early")),
            }
        }
        _ => Ok(Response::not_found()),
    }
}

fn main() -> EtudeResult<()> {
    logging::init_logging();
    let config = Config::from_env()?;
    Server::from_config(&config)?.handle_signals(true).run(hello)
}
