//! Command implementations.

mod arrange;
mod request;
mod sign;
mod verify;

pub use arrange::ArrangeCommand;
pub use request::RequestCommand;
pub use sign::SignCommand;
pub use verify::VerifyCommand;
