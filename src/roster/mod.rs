//! Roster Module - Bekannte Peers
//!
//! Hält die vom Relay gemeldeten Peers im Speicher. Es gibt keinen
//! persistenten Zustand, der Roster lebt so lange wie der Client.

mod peers;

pub use peers::{PeerEntry, Roster};
