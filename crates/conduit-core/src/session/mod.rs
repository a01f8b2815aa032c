//! Gateway and backend session handling.
//!
//! Two kinds of session exist and are kept strictly apart: the gateway
//! session (a signed token the broker mints for clients) and the backend
//! session (an opaque string a backend returns from its own initialize).
//! The cache maps pairs of the two; the signer owns the first kind.

pub mod cache;
pub mod token;

pub use cache::{MemoryStore, SessionCache, SessionKey, SessionStore};
pub use token::{SessionClaims, SessionSigner};
