pub mod framed;
pub mod message;

pub use framed::FramedTransport;
pub use message::{MessageKind, MessageTransport, ReceivedMessage};
