//! The two request/response pairs of the config handshake.

pub(crate) mod count_message;
pub(crate) mod slot_message;
