pub mod autoindex;
pub mod session;
pub mod sweeper;
