//! The SMTP protocol client used by the sender.
//!
//! It implements the parts of [RFC 5321](https://tools.ietf.org/html/rfc5321) needed for a
//! single submission over STARTTLS ([RFC 3207](https://tools.ietf.org/html/rfc3207)) with
//! `PLAIN` or `LOGIN` authentication ([RFC 4954](https://tools.ietf.org/html/rfc4954)).

pub mod authentication;
pub mod client;
pub mod commands;
pub mod error;
pub mod extension;
pub mod response;
pub mod stream;

// Registered port numbers:
// https://www.iana.
// org/assignments/service-names-port-numbers/service-names-port-numbers.xhtml

/// Default submission port
pub const SUBMISSION_PORT: u16 = 587;
