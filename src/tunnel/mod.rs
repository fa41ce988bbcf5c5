//! The tunnel runtime: framed control messaging, the UDP data plane, and
//! the session lifecycle binding them together.

pub mod dispatcher;
pub mod messenger;
pub mod packet;
pub mod pipe;
pub mod session;
pub mod stats;

pub use dispatcher::Dispatcher;
pub use messenger::Messenger;
pub use packet::{Message, Packet};
pub use pipe::DataPipe;
pub use session::{ClientSessionHandler, ServerSessionHandler};
