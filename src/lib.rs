//! smtp-probe sends a single message through an SMTP relay and traces the exchange.
//!
//! The connection always starts in plaintext, is upgraded with `STARTTLS`,
//! authenticates and submits one message. Every step is logged at `debug`
//! level so the dialogue with the relay can be inspected by hand.
//!
//! ```no_run
//! use smtp_probe::{ConnectionConfig, Credentials, MailSender, OutboundMessage};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::new("smtp.example.org");
//! let credentials = Credentials::new("user@example.org".to_string(), "secret".to_string());
//! let message = OutboundMessage::new(
//!     "user@example.org".parse()?,
//!     "root@example.org".parse()?,
//!     "Hi there",
//!     "This message is sent from Rust.",
//! );
//!
//! MailSender::new().send(&config, &credentials, &message).await?;
//! # Ok(())
//! # }
//! ```

#![deny(
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    missing_debug_implementations,
    clippy::unwrap_used
)]

pub mod codec;
pub mod config;
pub mod error;
pub mod sender;
pub mod smtp;
mod types;

pub use types::*;

pub use crate::config::{ConnectionConfig, ProbeConfig};
pub use crate::sender::{MailSender, SendError};
pub use crate::smtp::authentication::Credentials;
pub use crate::smtp::client::net::{ClientTlsParameters, Connector, TcpConnector};
