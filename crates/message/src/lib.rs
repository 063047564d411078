pub mod address;
pub mod dsn;
pub mod message;

pub use crate::address::EnvelopeAddress;
pub use crate::message::{Message, MetaData, RecipientFailure, RecordedError, SourceInfo};
