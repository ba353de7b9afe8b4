//! `wirecall-protocol` — wire framing and error taxonomy for the wirecall
//! RPC protocol.
//!
//! The protocol exchanges UTF-8 JSON array frames over any message-oriented
//! transport.  Three frame shapes exist:
//!
//! ```text
//! CALL:   [2, "<correlation-id>", "<method>", <params>]
//! RESULT: [3, "<correlation-id>", <result>]
//! ERROR:  [4, "<correlation-id>", "<code>", "<description>", <details>]
//! ```
//!
//! This crate is deliberately transport- and runtime-free: it only knows how
//! to encode, decode, and classify frames.  The connection engine lives in
//! `wirecall-rpc`.

mod error;
mod frame;

pub use error::{ErrorCode, WireError, LEGACY_SUBPROTOCOL};
pub use frame::{decode, DecodeError, Frame, MessageType};

/// Correlation id echoed on ERROR frames when the inbound id is unknowable.
pub const INDETERMINATE_ID: &str = "-1";
