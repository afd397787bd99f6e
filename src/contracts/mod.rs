pub mod message;
pub mod processing_error;

pub use message::{DecodeError, Message, decode, encode, excerpt};
pub use processing_error::{ErrorHandlerError, StepError};
