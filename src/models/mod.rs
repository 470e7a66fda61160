pub mod session;
pub mod token;

pub use session::{LoginQueue, Session};
pub use token::{OauthToken, TokenKind};
