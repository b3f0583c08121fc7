//! Raw wire structs. Everything here is byte layout only; meaning is given
//! to these structs by the typed request and reply modules.

pub(crate) mod command_reply;
pub(crate) mod command_request;
pub(crate) mod option_reply;
pub(crate) mod option_request;
