//! ESMTP features

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::result::Result;

use crate::smtp::authentication::Mechanism;
use crate::smtp::error::Error;
use crate::smtp::response::Response;

/// Default client id
const DEFAULT_DOMAIN_CLIENT_ID: &str = "localhost";

/// Client identifier, the parameter to `EHLO`
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum ClientId {
    /// A fully-qualified domain name
    Domain(String),
    /// An IPv4 address
    Ipv4(Ipv4Addr),
    /// An IPv6 address
    Ipv6(Ipv6Addr),
}

impl Default for ClientId {
    fn default() -> Self {
        // https://tools.ietf.org/html/rfc5321#section-4.1.4
        //
        // The SMTP client MUST, if possible, ensure that the domain parameter
        // to the EHLO command is a primary host name as specified for this
        // command in Section 2.3.5.  If this is not possible (e.g., when the
        // client's address is dynamically assigned and the client does not have
        // an obvious name), an address literal SHOULD be substituted for the
        // domain name.
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
            .map(ClientId::Domain)
            .unwrap_or_else(|| ClientId::new(DEFAULT_DOMAIN_CLIENT_ID.to_string()))
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            ClientId::Domain(ref value) => f.write_str(value),
            ClientId::Ipv4(ref value) => write!(f, "[{}]", value),
            ClientId::Ipv6(ref value) => write!(f, "[IPv6:{}]", value),
        }
    }
}

impl ClientId {
    /// Creates a new `ClientId` from a fully qualified domain name
    pub fn new(domain: String) -> ClientId {
        ClientId::Domain(domain)
    }
}

/// Supported ESMTP keywords
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub enum Extension {
    /// 8BITMIME keyword
    ///
    /// RFC 6152: https://tools.ietf.org/html/rfc6152
    EightBitMime,
    /// SMTPUTF8 keyword
    ///
    /// RFC 6531: https://tools.ietf.org/html/rfc6531
    SmtpUtfEight,
    /// STARTTLS keyword
    ///
    /// RFC 2487: https://tools.ietf.org/html/rfc2487
    StartTls,
    /// PIPELINING keyword
    ///
    /// RFC 2920: https://tools.ietf.org/html/rfc2920
    Pipelining,
    /// AUTH mechanism
    Authentication(Mechanism),
}

impl Display for Extension {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Extension::EightBitMime => write!(f, "8BITMIME"),
            Extension::SmtpUtfEight => write!(f, "SMTPUTF8"),
            Extension::StartTls => write!(f, "STARTTLS"),
            Extension::Pipelining => write!(f, "PIPELINING"),
            Extension::Authentication(ref mechanism) => write!(f, "AUTH {}", mechanism),
        }
    }
}

/// Contains information about an SMTP server
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerInfo {
    /// Server name
    ///
    /// The name given in the server banner
    pub name: String,
    /// ESMTP features supported by the server
    ///
    /// It contains the features supported by the server and known by the `Extension` module.
    pub features: HashSet<Extension>,
}

impl Display for ServerInfo {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut features: Vec<String> = self.features.iter().map(ToString::to_string).collect();
        features.sort();
        write!(
            f,
            "{} with {}",
            self.name,
            if features.is_empty() {
                "no supported features".to_string()
            } else {
                features.join(", ")
            }
        )
    }
}

impl ServerInfo {
    /// Parses a EHLO response to create a `ServerInfo`
    pub fn from_response(response: &Response) -> Result<ServerInfo, Error> {
        let name = match response.first_word() {
            Some(name) => name,
            None => return Err(Error::ResponseParsing("Could not read server name")),
        };

        let mut features: HashSet<Extension> = HashSet::new();

        for line in response.message.as_slice() {
            if line.is_empty() {
                continue;
            }

            let mut split = line.split_whitespace();
            match split.next().map(str::to_ascii_uppercase).as_deref() {
                Some("8BITMIME") => {
                    features.insert(Extension::EightBitMime);
                }
                Some("SMTPUTF8") => {
                    features.insert(Extension::SmtpUtfEight);
                }
                Some("STARTTLS") => {
                    features.insert(Extension::StartTls);
                }
                Some("PIPELINING") => {
                    features.insert(Extension::Pipelining);
                }
                Some("AUTH") => {
                    for mechanism in split {
                        match mechanism.to_ascii_uppercase().as_str() {
                            "PLAIN" => {
                                features.insert(Extension::Authentication(Mechanism::Plain));
                            }
                            "LOGIN" => {
                                features.insert(Extension::Authentication(Mechanism::Login));
                            }
                            _ => (),
                        }
                    }
                }
                _ => (),
            };
        }

        Ok(ServerInfo {
            name: name.to_string(),
            features,
        })
    }

    /// Checks if the server supports an ESMTP feature
    pub fn supports_feature(&self, keyword: Extension) -> bool {
        self.features.contains(&keyword)
    }

    /// Checks if the server supports an ESMTP feature
    pub fn supports_auth_mechanism(&self, mechanism: Mechanism) -> bool {
        self.features
            .contains(&Extension::Authentication(mechanism))
    }
}

/// A `MAIL FROM` extension parameter
#[derive(PartialEq, Eq, Clone, Debug, Copy)]
pub enum MailParameter {
    /// `BODY` parameter
    Body(MailBodyParameter),
}

impl Display for MailParameter {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            MailParameter::Body(ref value) => write!(f, "BODY={}", value),
        }
    }
}

/// Values for the `BODY` parameter to `MAIL FROM`
#[derive(PartialEq, Eq, Clone, Debug, Copy)]
pub enum MailBodyParameter {
    /// `8BITMIME`
    EightBitMime,
}

impl Display for MailBodyParameter {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            MailBodyParameter::EightBitMime => f.write_str("8BITMIME"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::{ClientId, Extension, ServerInfo};
    use crate::smtp::authentication::Mechanism;
    use crate::smtp::response::{Category, Code, Detail, Response, Severity};

    fn ehlo_response(lines: &[&str]) -> Response {
        Response::new(
            Code::new(Severity::PositiveCompletion, Category::MailSystem, Detail(0)),
            lines.iter().map(|line| line.to_string()).collect(),
        )
    }

    #[test]
    fn test_clientid_fmt() {
        assert_eq!(
            format!("{}", ClientId::new("test".to_string())),
            "test".to_string()
        );
        assert_eq!(
            format!("{}", ClientId::Ipv4("127.0.0.1".parse().unwrap())),
            "[127.0.0.1]"
        );
        assert_eq!(format!("{}", ClientId::Ipv6("::1".parse().unwrap())), "[IPv6:::1]");
    }

    #[test]
    fn test_extension_fmt() {
        assert_eq!(
            format!("{}", Extension::EightBitMime),
            "8BITMIME".to_string()
        );
        assert_eq!(
            format!("{}", Extension::Authentication(Mechanism::Plain)),
            "AUTH PLAIN".to_string()
        );
    }

    #[test]
    fn test_serverinfo_fmt() {
        let mut eightbitmime = HashSet::new();
        assert!(eightbitmime.insert(Extension::EightBitMime));

        assert_eq!(
            format!(
                "{}",
                ServerInfo {
                    name: "name".to_string(),
                    features: eightbitmime,
                }
            ),
            "name with 8BITMIME".to_string()
        );

        assert_eq!(
            format!(
                "{}",
                ServerInfo {
                    name: "name".to_string(),
                    features: HashSet::new(),
                }
            ),
            "name with no supported features".to_string()
        );
    }

    #[test]
    fn test_serverinfo() {
        let response = ehlo_response(&[
            "smtp.example.org Hello client",
            "8BITMIME",
            "SIZE 42",
            "STARTTLS",
            "AUTH PLAIN LOGIN CRAM-MD5",
        ]);

        let server_info = ServerInfo::from_response(&response).unwrap();

        assert_eq!(server_info.name, "smtp.example.org");
        assert!(server_info.supports_feature(Extension::EightBitMime));
        assert!(server_info.supports_feature(Extension::StartTls));
        assert!(!server_info.supports_feature(Extension::SmtpUtfEight));
        assert!(!server_info.supports_feature(Extension::Pipelining));
        assert!(server_info.supports_auth_mechanism(Mechanism::Plain));
        assert!(server_info.supports_auth_mechanism(Mechanism::Login));
    }

    #[test]
    fn test_serverinfo_without_extensions() {
        let response = ehlo_response(&["me"]);
        let server_info = ServerInfo::from_response(&response).unwrap();
        assert_eq!(server_info.name, "me");
        assert!(server_info.features.is_empty());

        assert!(ServerInfo::from_response(&ehlo_response(&[])).is_err());
    }

    #[test]
    fn test_lowercase_keywords() {
        let response = ehlo_response(&["me", "starttls", "auth login"]);
        let server_info = ServerInfo::from_response(&response).unwrap();
        assert!(server_info.supports_feature(Extension::StartTls));
        assert!(server_info.supports_auth_mechanism(Mechanism::Login));
        assert!(!server_info.supports_auth_mechanism(Mechanism::Plain));
    }
}
