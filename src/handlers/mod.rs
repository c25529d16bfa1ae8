pub mod config;
pub mod session;

pub use self::config::*;
pub use self::session::*;
