//! SMTP command framing and the per-connection state machine.

pub mod command;
pub mod reply;
pub mod session;

pub use command::{parse, Command, ParseError};
pub use reply::Reply;
pub use session::{Action, Envelope, Session, State};
