//! # obfs4
//!
//! An obfuscated stream transport: a bidirectional reliable byte pipe over
//! TCP whose observable wire image is indistinguishable from a uniform
//! random stream, resisting passive distinguishers, active probing, and
//! trivial replay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Layer                     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Connection (state machine, burst padding, delay close)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Packet Layer (typed payloads, PRNG seed negotiation)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Frame Layer (SecretBox AEAD, obfuscated lengths)        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Handshake (ntor over Elligator2, mark/MAC, epoch hour)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Unobservability**: every byte on the wire, handshake included, is
//!    computationally indistinguishable from random
//! 2. **Authentication**: one-way authenticated key agreement against a
//!    pre-shared bridge identity, with anti-replay and epoch binding
//! 3. **Probe resistance**: failed handshakes are indistinguishable from
//!    quiet long-lived flows
//!
//! Clients and bridges agree on the bridge's node ID, identity public key,
//! and randomness seed out-of-band; see [`transport::ClientFactory`] and
//! [`transport::ServerFactory`] for how a host wires the pieces together.

#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod packet;
pub mod probdist;
pub mod replay;
pub mod transport;

pub use error::{Error, Result};
pub use transport::{
    Args, ClientFactory, Obfs4Stream, Registry, ServerFactory, Transport, TRANSPORT_NAME,
};
