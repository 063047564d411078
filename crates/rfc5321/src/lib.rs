pub mod client;
pub mod client_types;
pub mod parser;
pub mod tls;
mod traits;

pub use traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};

pub use client::*;
pub use client_types::*;
pub use parser::*;
