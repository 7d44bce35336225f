use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Connection state as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// What the hub needs from an observer connection.
///
/// `send` and `ping` only enqueue; they never wait on the peer.
/// Pong and close notifications flow the other way, through
/// [`ObserverHub::pong`](crate::hub::ObserverHub::pong) and
/// [`ObserverHub::remove`](crate::hub::ObserverHub::remove).
pub trait ObserverSocket: Send + Sync {
    fn ready_state(&self) -> ReadyState;

    /// Bytes queued for the peer but not yet written.
    fn buffered_amount(&self) -> usize;

    fn send(&self, text: String) -> Result<(), String>;

    fn ping(&self);

    fn close(&self, reason: &str);
}

enum Outbound {
    Text(String),
    Ping,
    Close(String),
}

/// [`ObserverSocket`] over the write half of an axum WebSocket.
///
/// A writer task drains an unbounded queue into the sink; `buffered_amount`
/// counts text bytes queued and not yet flushed. Once the writer stops (a
/// close was sent or a write failed), [`closed`](Self::closed) resolves.
pub struct WsSocket {
    tx: mpsc::UnboundedSender<Outbound>,
    buffered: Arc<AtomicUsize>,
    state: Arc<AtomicU8>,
    closed: CancellationToken,
}

impl WsSocket {
    pub fn spawn<S>(mut sink: S) -> (Arc<Self>, JoinHandle<()>)
    where
        S: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(AtomicU8::new(ReadyState::Open as u8));
        let closed = CancellationToken::new();

        let writer_buffered = buffered.clone();
        let writer_state = state.clone();
        let writer_closed = closed.clone();
        let writer = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let result = match out {
                    Outbound::Text(text) => {
                        let len = text.len();
                        let sent = sink.send(Message::Text(text.into())).await;
                        writer_buffered.fetch_sub(len, Ordering::SeqCst);
                        sent
                    }
                    Outbound::Ping => sink.send(Message::Ping(Default::default())).await,
                    Outbound::Close(reason) => {
                        let frame = CloseFrame {
                            code: close_code::AWAY,
                            reason: reason.into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    debug!(error = %e, "WebSocket write failed");
                    break;
                }
            }
            writer_state.store(ReadyState::Closed as u8, Ordering::SeqCst);
            writer_closed.cancel();
        });

        (
            Arc::new(Self {
                tx,
                buffered,
                state,
                closed,
            }),
            writer,
        )
    }

    /// Resolves once nothing more can be written to the peer.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn mark_closed(&self) {
        self.state.store(ReadyState::Closed as u8, Ordering::SeqCst);
        self.closed.cancel();
    }
}

impl ObserverSocket for WsSocket {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn send(&self, text: String) -> Result<(), String> {
        if self.ready_state() != ReadyState::Open {
            return Err("socket is not open".into());
        }
        let len = text.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.tx.send(Outbound::Text(text)).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            "writer has stopped".to_string()
        })
    }

    fn ping(&self) {
        let _ = self.tx.send(Outbound::Ping);
    }

    fn close(&self, reason: &str) {
        self.state.store(ReadyState::Closing as u8, Ordering::SeqCst);
        let _ = self.tx.send(Outbound::Close(reason.to_string()));
    }
}
