// src/handler.rs
use crate::error::WsError;
use crate::handshake::handshake;
use crate::session::WebSocket;
use etude_core::{Context, EtudeResult, Handler, Response};
use tracing::{debug, warn};

/// Serves every request as a websocket: upgrades it, runs the session
/// function inside the request's coroutine, then closes the session.
///
/// Requests that are not valid upgrades are answered with a 4xx and never
/// reach the session function.
///
/// ```no_run
/// use etude_core::Server;
/// use etude_ws::{WebSocket, WebSocketHandler, WsError};
///
/// fn echo(ws: WebSocket) -> Result<(), WsError> {
///     while let Some(msg) = ws.wait()? {
///         ws.send(msg)?;
///     }
///     Ok(())
/// }
///
/// let server = Server::bind("127.0.0.1:8000".parse().unwrap()).unwrap();
/// server.run(WebSocketHandler::new(echo)).unwrap();
/// ```
pub struct WebSocketHandler<F> {
    session: F,
    subprotocols: Vec<String>,
}

impl<F> WebSocketHandler<F>
where
    F: Fn(WebSocket) -> Result<(), WsError> + Send + Sync + 'static,
{
    pub fn new(session: F) -> Self {
        Self {
            session,
            subprotocols: Vec::new(),
        }
    }

    /// Subprotocols this server speaks, in no particular order.
    pub fn with_subprotocols(mut self, protocols: &[&str]) -> Self {
        self.subprotocols = protocols.iter().map(|p| p.to_string()).collect();
        self
    }
}

impl<F> Handler for WebSocketHandler<F>
where
    F: Fn(WebSocket) -> Result<(), WsError> + Send + Sync + 'static,
{
    fn call(&self, ctx: &mut Context) -> EtudeResult<Response> {
        let protocols: Vec<&str> = self.subprotocols.iter().map(String::as_str).collect();
        let ws = match handshake(ctx, &protocols) {
            Ok(ws) => ws,
            Err(e) => {
                debug!(path = %ctx.request.path, "websocket handshake refused: {e}");
                return Ok(e.into_response());
            }
        };

        let result = (self.session)(ws.clone());
        ws.close();
        if let Err(e) = &result {
            warn!(path = %ws.path(), "websocket session failed: {e}");
        }
        result?;
        // Never written: the connection no longer speaks HTTP.
        Ok(Response::new(101))
    }
}
