//! Jackpot domain types.
//!
//! Defines the account, round, wager and withdrawal entities shared by the
//! execution layer and the node, plus the events pushed to clients. Persisted
//! entities implement the commonware codec; client-facing shapes implement
//! serde.

mod account;
mod codec;
mod constants;
mod event;
mod round;
mod withdrawal;

pub use account::*;
pub use codec::{
    optional_string_encode_size, read_optional_string, read_string, string_encode_size,
    write_optional_string, write_string,
};
pub use constants::*;
pub use event::*;
pub use round::*;
pub use withdrawal::*;
