// examples/websocket_chat.rs
//! Browser chat room: open http://localhost:8000 in two tabs.
use etude_core::{Config, Context, EtudeResult, Response, Server, logging};
use etude_ws::{WebSocket, handshake};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

const PAGE: &str = r#"<!doctype html>
<html>
<body>
<ul id="log"></ul>
<form id="f"><input id="msg" autocomplete="off"><button>send</button></form>
<script>
const ws = new WebSocket(`ws://${location.host}/chat`);
ws.onmessage = (e) => {
  const li = document.createElement("li");
  li.textContent = e.data;
  document.getElementById("log").appendChild(li);
};
document.getElementById("f").onsubmit = (e) => {
  e.preventDefault();
  const input = document.getElementById("msg");
  ws.send(input.value);
  input.value = "";
};
</script>
</body>
</html>
"#;

#[derive(Default)]
struct Room {
    participants: Mutex<Vec<WebSocket>>,
}

impl Room {
    fn join(&self, ctx: &mut Context) -> EtudeResult<Response> {
        let ws = match handshake(ctx, &[]) {
            Ok(ws) => ws,
            Err(e) => return Ok(e.into_response()),
        };
        self.participants.lock().push(ws.clone());
        info!(peer = %ctx.peer_addr(), "joined");

        let result = self.relay(&ws);
        self.participants.lock().retain(|p| *p != ws);
        ws.close();
        info!(peer = %ctx.peer_addr(), "left");
        result?;
        Ok(Response::new(101))
    }

    fn relay(&self, ws: &WebSocket) -> Result<(), etude_ws::WsError> {
        while let Some(message) = ws.wait()? {
            let everyone = self.participants.lock().clone();
            for p in &everyone {
                if p.send(message.clone()).is_err() {
                    p.close();
                }
            }
        }
        Ok(())
    }
}

fn main() -> EtudeResult<()> {
    logging::init_logging();
    let room = Arc::new(Room::default());
    let config = Config::from_env()?;
    Server::from_config(&config)?
        .handle_signals(true)
        .run(move |ctx: &mut Context| match ctx.request.path.as_str() {
            "/chat" => room.join(ctx),
            "/" => Ok(Response::new(200)
                .with_header("Content-Type", "text/html")
                .with_body(PAGE)),
            _ => Ok(Response::not_found()),
        })
}
