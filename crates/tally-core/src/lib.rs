mod backend;

pub mod audit;
pub mod config;
pub mod extract;
pub mod followup;
pub mod normalize;
pub mod primary;
pub mod relay;
pub mod session;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 39731;

pub use audit::*;
pub use config::*;
pub use extract::*;
pub use followup::{follow_up_messages, FollowUpFault, FollowUpSession, FollowUpSummary};
pub use normalize::*;
pub use primary::*;
pub use relay::*;
pub use session::*;
