//! Identity Module - Session Token
//!
//! Dieses Modul verwaltet die Identität des lokalen Clients:
//! - Generierung eines zufälligen Tokens beim Start
//! - Validierung von Tokens aus eingehenden Nachrichten
//!

mod token;

pub use token::{Identity, IdentityError, TOKEN_LENGTH};
