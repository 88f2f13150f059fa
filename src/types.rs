use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::error::EmailResult;
use crate::error::Error;

/// Email address
#[derive(PartialEq, Eq, Clone, Debug, serde_derive::Serialize, serde_derive::Deserialize)]
#[serde(try_from = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn new(address: String) -> EmailResult<EmailAddress> {
        // Do basic checks to avoid injection of control characters into SMTP protocol.  Actual
        // email validation should be done by the server.
        if address.is_empty()
            || address.chars().any(|c| {
                !c.is_ascii()
                    || c.is_ascii_control()
                    || c.is_ascii_whitespace()
                    || c == '<'
                    || c == '>'
            })
        {
            return Err(Error::InvalidEmailAddress);
        }

        Ok(EmailAddress(address))
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = Error;

    fn try_from(address: String) -> Result<Self, Self::Error> {
        EmailAddress::new(address)
    }
}

impl FromStr for EmailAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmailAddress::new(s.to_string())
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Simple email envelope representation
///
/// We only accept mailboxes, and do not support source routes (as per RFC).
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Envelope {
    /// The envelope recipients' addresses
    forward_path: Vec<EmailAddress>,
    /// The envelope sender address
    reverse_path: Option<EmailAddress>,
}

impl Envelope {
    /// Destination addresses of the envelope
    pub fn to(&self) -> &[EmailAddress] {
        self.forward_path.as_slice()
    }

    /// Source address of the envelope
    pub fn from(&self) -> Option<&EmailAddress> {
        self.reverse_path.as_ref()
    }
}

/// The single message submitted by a probe run.
///
/// The raw text is a minimal internet message: a `Subject:` header, a blank
/// line and the body, with CRLF line endings.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct OutboundMessage {
    sender: EmailAddress,
    recipient: EmailAddress,
    raw: String,
}

impl OutboundMessage {
    /// Builds the message text from a subject and a body.
    ///
    /// Line breaks in the subject are folded into single spaces, so it always
    /// stays one header line.
    pub fn new<S: AsRef<str>, B: AsRef<str>>(
        sender: EmailAddress,
        recipient: EmailAddress,
        subject: S,
        body: B,
    ) -> OutboundMessage {
        let raw = format!(
            "Subject: {}\r\n\r\n{}",
            header_value(subject.as_ref()),
            to_crlf(body.as_ref())
        );
        OutboundMessage {
            sender,
            recipient,
            raw,
        }
    }

    pub fn sender(&self) -> &EmailAddress {
        &self.sender
    }

    pub fn recipient(&self) -> &EmailAddress {
        &self.recipient
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The SMTP envelope: one reverse path, one forward path.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            forward_path: vec![self.recipient.clone()],
            reverse_path: Some(self.sender.clone()),
        }
    }
}

/// Trims and joins the lines of `value` with single spaces.
fn header_value(value: &str) -> String {
    value
        .split(|c: char| c == '\r' || c == '\n')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turns lone `\n` and `\r` into `\r\n`.
fn to_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\r\n");
            }
            '\n' => out.push_str("\r\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_email_address() {
        assert!(EmailAddress::new("foobar@example.org".to_string()).is_ok());
        assert!(EmailAddress::new("foobar@localhost".to_string()).is_ok());
        assert!(EmailAddress::new("foo\rbar@localhost".to_string()).is_err());
        assert!(EmailAddress::new(
            "617b5772c6d10feda41fc6e0e43b976c4cc9383d3729310d3dc9e1332f0d9acd@yggmail".to_string()
        )
        .is_ok());
        assert!(EmailAddress::new(">foobar@example.org".to_string()).is_err());
        assert!(EmailAddress::new("foo bar@example.org".to_string()).is_err());
        assert!(EmailAddress::new("foobar@exa\r\nmple.org".to_string()).is_err());
        assert!(EmailAddress::new("fööbar@example.org".to_string()).is_err());
        assert!(EmailAddress::new(String::new()).is_err());
    }

    #[test]
    fn test_message_text() {
        let message = OutboundMessage::new(
            "user@localhost".parse().unwrap(),
            "root@localhost".parse().unwrap(),
            "Hi there",
            "line one\nline two",
        );
        assert_eq!(
            message.raw(),
            "Subject: Hi there\r\n\r\nline one\r\nline two"
        );

        let envelope = message.envelope();
        assert_eq!(envelope.from().map(|a| a.as_ref()), Some("user@localhost"));
        assert_eq!(envelope.to().len(), 1);
        assert_eq!(envelope.to()[0].as_ref(), "root@localhost");
    }

    #[test]
    fn test_subject_stays_on_one_line() {
        let message = OutboundMessage::new(
            "user@localhost".parse().unwrap(),
            "root@localhost".parse().unwrap(),
            "Hi\nBcc: victim@example.org\r\n",
            "body",
        );
        assert_eq!(
            message.raw(),
            "Subject: Hi Bcc: victim@example.org\r\n\r\nbody"
        );
        assert_eq!(header_value("  Hi there \r"), "Hi there");
    }

    #[test]
    fn test_crlf_normalisation() {
        assert_eq!(to_crlf("a\r\nb\nc\rd"), "a\r\nb\r\nc\r\nd");
        assert_eq!(to_crlf(""), "");
        assert_eq!(to_crlf("\n\n"), "\r\n\r\n");
    }
}
