//! Authentication Module
//! Bearer tokens for the logging API, cached for a fixed lifetime.

pub mod token;

pub use token::{AuthError, GcloudTokenSource, StaticTokenSource, Token, TokenCache, TokenSource};
