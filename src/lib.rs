//! Quictun carries remote login, TCP port forwarding and a point-to-point VPN over multiplexed
//! QUIC streams.
//!
//! Peers are identified by a persistent key pair (ECDSA or ED25519). Every connection presents a
//! just-in-time certificate made from that key, and once the QUIC session is up the peers run a
//! short challenge-response on a control stream: the claimant signs both peers' nonces together
//! with a connection identifier exported from the TLS session, so a proof can't be replayed on
//! another connection. Trust is decided on the public key alone, through a [`TrustStore`] of
//! authorized keys on servers and known hosts on clients.
//!
//! On top of an authenticated [`Session`]:
//!
//! - [`forward`] listens for local TCP connections and forwards each over its own stream, in
//!   either direction;
//! - [`login`] bridges the control stream to a login service or a terminal;
//! - [`transmitter`] moves IP packets between a [`PacketDevice`] and the session, one stream per
//!   flow, with idle flows reaped and late packets ECN-marked.
//!
//! [`server`], [`client`] and [`vpn`] tie these together into complete sessions.
//!
//! All communications are secured with TLS 1.3, with RSA explicitly disabled.
//!
//! # Example
//!
//! ```no_run
//! use quictun::{Endpoint, EndpointOptions, Key, client::{Client, ClientOptions}};
//!
//! # async fn run() -> Result<(), quictun::Error> {
//! let key = Key::generate()?;
//! let end = Endpoint::new("[::]:0", key, EndpointOptions::default())?;
//!
//! let client = Client::connect(&end, "remotepeer.example.com:4433", ClientOptions::default(), |_, _| true).await?;
//! client.run(tokio::io::stdin(), tokio::io::stdout(), std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]

pub use crate::{
    device::*, endpoint::*, error::*, key::*, provider::crypto_provider, session::*,
    trust::{TrustEntry, TrustStore},
};
pub use quinn;
pub use rcgen;
pub use rustls::{self, CertificateError};

pub mod addr;
pub mod auth;
pub mod client;
pub mod codec;
pub mod flow;
pub mod forward;
pub mod login;
pub mod packet;
pub mod server;
pub mod transmitter;
pub mod trust;
pub mod vpn;

mod device;
mod endpoint;
mod error;
mod key;
mod provider;
mod session;
