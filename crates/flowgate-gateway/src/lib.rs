//! Observer fan-out and the HTTP/WebSocket surface.

mod connection;
pub mod hub;
mod protocol;
mod routes;
mod server;
pub mod socket;
mod state;

pub use hub::{Delivery, ObserverHub, ObserverId};
pub use server::{router, GatewayServer};
pub use socket::{ObserverSocket, ReadyState, WsSocket};
pub use state::AppState;
