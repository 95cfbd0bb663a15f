//! `parley-auth` — caller authentication boundary.
//!
//! Decodes and verifies bearer tokens into [`JwtClaims`]. Decoupled from HTTP
//! and storage: the API layer turns verified claims into a caller context.

pub mod claims;
pub mod roles;
pub mod validator;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use roles::Role;
pub use validator::{Hs256JwtValidator, JwtValidator};
