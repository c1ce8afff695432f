pub mod types;
pub mod protocol;
pub mod chunk;
pub mod beacon;
pub mod error;

pub use types::*;
pub use protocol::*;
pub use chunk::*;
pub use beacon::*;
pub use error::*;
