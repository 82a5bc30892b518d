//! Backend-specific event normalization
//!
//! Each backend speaks its own wire protocol; these modules map both onto
//! the canonical schema in [`crate::protocol`]. [`turn`] handles the
//! turn-based SDK's item/turn event vocabulary, [`stream`] the token
//! streaming CLI's near-canonical output.

pub mod stream;
pub mod turn;

pub use stream::{NativeStreamMessage, StreamNormalizer};
pub use turn::{ThreadEvent, ThreadItem, ThreadItemDetails, TurnNormalizer};
