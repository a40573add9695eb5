//! Record layer: wire framing, AEAD seal/open, and replay protection.
//!
//! The record layer delivers each authenticated, non-replayed frame
//! exactly once. It does NOT deliver in order; higher layers must
//! tolerate reordering. Frames that fail authentication or replay are
//! dropped silently (no reply frame) and counted.

pub mod frame;
pub mod layer;
pub mod replay;

pub use frame::{FrameHeader, MessageType, nonce_from_sequence};
pub use layer::{OpenedFrame, RecordLayer, RecordStats};
pub use replay::ReplayWindow;
