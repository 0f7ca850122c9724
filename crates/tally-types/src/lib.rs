mod frame;
mod message;
mod provider;
mod tool;

pub use frame::*;
pub use message::*;
pub use provider::*;
pub use tool::*;
