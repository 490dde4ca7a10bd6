//! Session handling: the credential token, the page guard and the CLI's
//! stored credential.
//!
//! The dashboard keeps the token in a non-HTTP-only `token` cookie. A
//! `?token=` query parameter (the OAuth callback lands with one) takes
//! precedence and is copied into the cookie. Client-side checks look at
//! structure and expiry only; the REST backend verifies the signature.

pub mod guard;
pub mod store;
pub mod token;

pub use guard::{CookieAction, Decision, GuardPaths, Outcome, Session, decide, session_guard};
pub use store::CredentialStore;
pub use token::{Claims, inspect, issue, verify};
