//! Transport layer: the async UDP socket wrapper.
//!
//! ClawChat runs exclusively over UDP. The wrapper owns a receive buffer
//! sized for the largest legal frame and exposes the handful of socket
//! operations the session loops need. During a port rotation the server
//! holds two of these side by side until the old socket's grace expires.

pub mod socket;

pub use socket::{ClawSocket, ClawSocketBuilder, DEFAULT_RECV_BUFFER_SIZE};
