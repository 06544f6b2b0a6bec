//! Network Layer
//!
//! Everything between a client socket and the turn engine: token checks,
//! wire messages, per-connection delivery, cross-instance fan-out and the
//! session/reconnection manager. Room correctness never depends on this
//! layer; a lost message is repaired by the next update or a resync.

pub mod auth;
pub mod backplane;
pub mod protocol;
pub mod session;
pub mod transport;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, AuthenticatedPlayer, TokenClaims};
pub use backplane::{Backplane, BackplaneError, LocalBackplane, RedisBackplane, RoomUpdate};
pub use protocol::{
    ClientMessage, ErrorCode, RoomSummary, RoomView, ServerMessage, TurnAction, TurnCommand,
};
pub use session::SessionManager;
pub use transport::{LocalTransport, Transport, TransportError};
