//! Line-oriented wire protocol: framing and message (de)serialization.
//!
//! Every connection, client or data-node, exchanges one logical message per
//! line: ASCII tokens separated by single spaces, terminated by `\n`. This
//! module is split into [`codec`] (reading/writing lines with deadlines) and
//! [`message`] (typed parsing/formatting of every message named in
//! `spec.md` §6).

pub mod codec;
pub mod message;

pub use codec::CodecError;
pub use message::{ClientReply, ClientRequest, NodeInbound, NodeOutbound, ParseError};
