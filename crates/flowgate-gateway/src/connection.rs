use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, Stream, StreamExt};
use tracing::debug;

use crate::hub::{ObserverHub, ObserverId};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::socket::{ObserverSocket, WsSocket};

/// Serve one observer until the peer goes away or the hub closes it.
pub async fn handle_connection(ws: WebSocket, hub: Arc<ObserverHub>) {
    let (sink, stream) = ws.split();
    serve(sink, stream, hub).await;
}

async fn serve<K, S>(sink: K, mut stream: S, hub: Arc<ObserverHub>)
where
    K: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (socket, writer) = WsSocket::spawn(sink);
    let id = hub.register(socket.clone());

    loop {
        // An idle close from the heartbeat stops the writer; the read half
        // must not outlive it waiting on a silent peer.
        let next = tokio::select! {
            _ = socket.closed() => {
                debug!(observer = id, "Observer closed by hub");
                break;
            }
            next = stream.next() => next,
        };
        let msg = match next {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                debug!(observer = id, error = %e, "WebSocket read error");
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => apply(&hub, id, frame),
                    Err(e) => ServerFrame::Error {
                        message: format!("Parse error: {}", e),
                    },
                };
                let _ = socket.send(reply.to_text());
            }
            Message::Pong(_) => hub.pong(id),
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.remove(id);
    socket.mark_closed();
    writer.abort();
    debug!(observer = id, "Observer disconnected");
}

fn apply(hub: &ObserverHub, id: ObserverId, frame: ClientFrame) -> ServerFrame {
    let topics = match frame {
        ClientFrame::Subscribe { topics } => hub.subscribe(id, &topics),
        ClientFrame::Unsubscribe { topics } => hub.unsubscribe(id, &topics),
    };
    match topics {
        Some(topics) => ServerFrame::Subscriptions { topics },
        None => ServerFrame::Error {
            message: "observer is no longer registered".into(),
        },
    }
}
