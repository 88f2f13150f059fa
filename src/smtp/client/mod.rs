//! SMTP client transport

pub mod mock;
pub mod net;
