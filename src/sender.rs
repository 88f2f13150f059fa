//! The probe itself: one message over an upgraded connection.
//!
//! The exchange is strictly linear:
//!
//! 1. connect and read the greeting
//! 2. `EHLO`
//! 3. `STARTTLS` and TLS handshake
//! 4. `EHLO` again, over TLS
//! 5. `AUTH`
//! 6. `MAIL FROM`, `RCPT TO`, `DATA`
//! 7. `QUIT`, whatever happened before

use log::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::smtp::authentication::{Credentials, Mechanism, DEFAULT_ENCRYPTED_MECHANISMS};
use crate::smtp::client::net::{Connector, NetworkStream, TcpConnector};
use crate::smtp::commands::*;
use crate::smtp::error::{Error, SmtpResult};
use crate::smtp::extension::{Extension, MailBodyParameter, MailParameter, ServerInfo};
use crate::smtp::response::Response;
use crate::smtp::stream::{with_timeout, SmtpStream};
use crate::OutboundMessage;

/// Number of `334` challenges accepted during a single `AUTH` exchange
const MAX_AUTH_CHALLENGES: usize = 10;

/// Failure of a send, tagged with the step that failed.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    /// Resolution, connection, greeting or first `EHLO` failed
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] Error),
    /// `STARTTLS` unavailable or refused, or the TLS handshake failed
    #[error("STARTTLS upgrade failed: {0}")]
    UpgradeFailed(#[source] Error),
    /// No common mechanism, or the credentials were rejected
    #[error("authentication failed: {0}")]
    AuthFailed(#[source] Error),
    /// `MAIL`, `RCPT`, `DATA` or the message content was rejected
    #[error("submission failed: {0}")]
    SubmissionFailed(#[source] Error),
}

impl SendError {
    /// The underlying protocol error
    pub fn smtp_error(&self) -> &Error {
        match *self {
            SendError::ConnectionFailed(ref err)
            | SendError::UpgradeFailed(ref err)
            | SendError::AuthFailed(ref err)
            | SendError::SubmissionFailed(ref err) => err,
        }
    }
}

/// Sends one message per call over a STARTTLS-upgraded connection.
#[derive(Debug, Default, Clone)]
pub struct MailSender<C = TcpConnector> {
    connector: C,
}

impl MailSender<TcpConnector> {
    /// A sender using plain TCP and `native-tls`
    pub fn new() -> Self {
        MailSender {
            connector: TcpConnector,
        }
    }
}

impl<C: Connector> MailSender<C> {
    /// A sender opening and upgrading its connections through `connector`
    pub fn with_connector(connector: C) -> Self {
        MailSender { connector }
    }

    /// Performs the whole exchange and returns the relay's answer to the message data.
    ///
    /// The connection is closed before returning, on success and on every failure.
    /// Credentials and message are never sent unless the TLS upgrade succeeded.
    pub async fn send(
        &self,
        config: &ConnectionConfig,
        credentials: &Credentials,
        message: &OutboundMessage,
    ) -> Result<Response, SendError> {
        if !config.starttls {
            return Err(SendError::UpgradeFailed(Error::Client(
                "STARTTLS is disabled, refusing to send in plaintext",
            )));
        }

        let stream = self
            .connector
            .connect(&config.host, config.port, config.timeout)
            .await
            .map_err(SendError::ConnectionFailed)?;

        debug!("connection established to {}:{}", config.host, config.port);

        let mut session = Session::new(stream, config);
        let result = self
            .transaction(&mut session, config, credentials, message)
            .await;
        session.close().await;

        match result {
            Ok(ref response) => info!(
                "status=sent ({})",
                response.first_line().unwrap_or("no response")
            ),
            Err(ref err) => info!("status=failed ({})", err),
        }

        result
    }

    async fn transaction(
        &self,
        session: &mut Session,
        config: &ConnectionConfig,
        credentials: &Credentials,
        message: &OutboundMessage,
    ) -> Result<Response, SendError> {
        session
            .greeting()
            .await
            .map_err(SendError::ConnectionFailed)?;
        session.ehlo().await.map_err(SendError::ConnectionFailed)?;

        self.starttls(session, config)
            .await
            .map_err(SendError::UpgradeFailed)?;
        session.ehlo().await.map_err(SendError::UpgradeFailed)?;

        session
            .login(credentials)
            .await
            .map_err(SendError::AuthFailed)?;

        session
            .submit(message)
            .await
            .map_err(SendError::SubmissionFailed)
    }

    async fn starttls(&self, session: &mut Session, config: &ConnectionConfig) -> Result<(), Error> {
        if !session.supports_feature(Extension::StartTls) {
            return Err(Error::Client("server does not support STARTTLS"));
        }

        session.stream()?.command(StarttlsCommand).await?;

        // The relay sends nothing more until the handshake, so no buffered bytes are lost.
        let plain = session.take_stream()?.into_inner();
        let tls_parameters = config.tls_parameters();
        let handshake = self.connector.upgrade_tls(plain, &tls_parameters);
        let encrypted = match with_timeout(config.timeout, handshake).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("TLS handshake failed, connection dropped");
                return Err(err);
            }
        };

        debug!("connection upgraded (encrypted: {})", encrypted.is_encrypted());
        session.resume(encrypted);
        Ok(())
    }
}

/// One connection and what the server told us about itself.
///
/// The stream is taken out on close, so it is closed at most once. Dropping a
/// session that was never closed only logs a warning; the socket itself goes
/// away with the `stream` field, without `QUIT`.
#[derive(Debug)]
struct Session {
    stream: Option<SmtpStream<NetworkStream>>,
    server_info: Option<ServerInfo>,
    config: ConnectionConfig,
}

impl Session {
    fn new(stream: NetworkStream, config: &ConnectionConfig) -> Session {
        let mut session = Session {
            stream: None,
            server_info: None,
            config: config.clone(),
        };
        session.resume(stream);
        session
    }

    fn stream(&mut self) -> Result<&mut SmtpStream<NetworkStream>, Error> {
        self.stream
            .as_mut()
            .ok_or(Error::Client("Connection closed"))
    }

    fn take_stream(&mut self) -> Result<SmtpStream<NetworkStream>, Error> {
        self.server_info = None;
        self.stream.take().ok_or(Error::Client("Connection closed"))
    }

    fn resume(&mut self, stream: NetworkStream) {
        let mut stream = SmtpStream::new(stream);
        stream.set_timeout(self.config.timeout);
        self.stream = Some(stream);
    }

    fn supports_feature(&self, keyword: Extension) -> bool {
        self.server_info
            .as_ref()
            .map(|info| info.supports_feature(keyword))
            .unwrap_or_default()
    }

    async fn greeting(&mut self) -> SmtpResult {
        let greeting = self.stream()?.greeting().await?;
        debug!("greeting {}", greeting);
        Ok(greeting)
    }

    /// Gets the EHLO response and updates server information.
    async fn ehlo(&mut self) -> SmtpResult {
        let client_id = self.config.hello_name.clone();
        let ehlo_response = self.stream()?.ehlo(client_id).await?;

        let server_info = ServerInfo::from_response(&ehlo_response)?;

        // Print server information
        debug!("server {}", server_info);

        self.server_info = Some(server_info);

        Ok(ehlo_response)
    }

    /// Authenticates with the first preferred mechanism the server offers.
    async fn login(&mut self, credentials: &Credentials) -> SmtpResult {
        let server_info = self
            .server_info
            .as_ref()
            .ok_or(Error::Client("no server information"))?;

        let mechanism = match DEFAULT_ENCRYPTED_MECHANISMS
            .iter()
            .find(|mechanism| server_info.supports_auth_mechanism(**mechanism))
        {
            Some(mechanism) => *mechanism,
            None => {
                info!("No supported authentication mechanisms available");
                return Err(Error::Client(
                    "No supported authentication mechanisms available",
                ));
            }
        };

        debug!("authenticating as {} with {}", credentials.username(), mechanism);
        self.auth(mechanism, credentials).await
    }

    /// Sends an AUTH command with the given mechanism, and handles challenge if needed
    async fn auth(&mut self, mechanism: Mechanism, credentials: &Credentials) -> SmtpResult {
        let stream = self.stream()?;
        let mut challenges = MAX_AUTH_CHALLENGES;
        let mut response = stream
            .sensitive_command(AuthCommand::new(mechanism, credentials)?)
            .await?;

        while challenges > 0 && response.has_code(334) {
            challenges -= 1;
            response = stream
                .sensitive_command(AuthCommand::new_from_response(
                    mechanism,
                    credentials,
                    &response,
                )?)
                .await?;
        }

        if response.has_code(334) {
            Err(Error::ResponseParsing("Unexpected number of challenges"))
        } else {
            Ok(response)
        }
    }

    /// Sends the envelope and the message content.
    async fn submit(&mut self, message: &OutboundMessage) -> SmtpResult {
        let mut mail_options = vec![];

        if self.supports_feature(Extension::EightBitMime) {
            mail_options.push(MailParameter::Body(MailBodyParameter::EightBitMime));
        }

        let envelope = message.envelope();
        let stream = self.stream()?;

        stream
            .command(MailCommand::new(envelope.from().cloned(), mail_options))
            .await?;

        // Recipient
        for to_address in envelope.to() {
            stream.command(RcptCommand::new(to_address.clone())).await?;
            // Log the rcpt command
            debug!("to=<{}>", to_address);
        }

        // Data
        stream.command(DataCommand).await?;

        stream.message(message.raw().as_bytes()).await
    }

    /// Sends `QUIT` and releases the connection.
    ///
    /// Errors are only logged: the connection is gone either way.
    async fn close(&mut self) {
        self.server_info = None;
        if let Some(mut stream) = self.stream.take() {
            match stream.close().await {
                Ok(()) => debug!("connection closed"),
                Err(err) => debug!("connection closed uncleanly: {}", err),
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.stream.is_some() {
            warn!("session dropped before QUIT, closing the socket");
        }
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;

    use super::*;
    use crate::smtp::client::mock::MockStream;
    use crate::smtp::client::net::ClientTlsParameters;
    use crate::smtp::extension::ClientId;

    /// Replays canned replies; the "upgrade" swaps in a second script.
    struct ScriptedConnector {
        plain: &'static [u8],
        encrypted: &'static [u8],
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            _host: &str,
            _port: u16,
            _timeout: Option<std::time::Duration>,
        ) -> Result<NetworkStream, Error> {
            Ok(NetworkStream::Mock(MockStream::with_vec(self.plain.to_vec())))
        }

        async fn upgrade_tls(
            &self,
            _stream: NetworkStream,
            _tls_parameters: &ClientTlsParameters,
        ) -> Result<NetworkStream, Error> {
            Ok(NetworkStream::Mock(MockStream::with_vec(
                self.encrypted.to_vec(),
            )))
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("relay.test").hello_name(ClientId::new("probe.test".to_string()))
    }

    fn credentials() -> Credentials {
        Credentials::new("user".to_string(), "password".to_string())
    }

    fn message() -> OutboundMessage {
        OutboundMessage::new(
            "user@localhost".parse().unwrap(),
            "root@localhost".parse().unwrap(),
            "Hi there",
            "Hello",
        )
    }

    #[test]
    fn test_send_error_display() {
        let err = SendError::AuthFailed(Error::Client("no mechanism"));
        assert_eq!(err.to_string(), "authentication failed: client: no mechanism");
        assert!(matches!(err.smtp_error(), Error::Client(_)));
    }

    #[tokio::test]
    async fn test_disabled_starttls_never_connects() {
        struct Unreachable;

        #[async_trait]
        impl Connector for Unreachable {
            async fn connect(
                &self,
                _host: &str,
                _port: u16,
                _timeout: Option<std::time::Duration>,
            ) -> Result<NetworkStream, Error> {
                panic!("must not connect");
            }

            async fn upgrade_tls(
                &self,
                _stream: NetworkStream,
                _tls_parameters: &ClientTlsParameters,
            ) -> Result<NetworkStream, Error> {
                panic!("must not upgrade");
            }
        }

        let mut config = config();
        config.starttls = false;
        let result = MailSender::with_connector(Unreachable)
            .send(&config, &credentials(), &message())
            .await;
        assert!(matches!(result, Err(SendError::UpgradeFailed(_))));
    }

    #[tokio::test]
    async fn test_rejected_greeting() {
        let sender = MailSender::with_connector(ScriptedConnector {
            plain: b"554 5.3.2 Service not available\r\n",
            encrypted: b"",
        });
        let result = sender.send(&config(), &credentials(), &message()).await;
        match result {
            Err(SendError::ConnectionFailed(Error::Permanent(response))) => {
                assert!(response.has_code(554))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_script() {
        let sender = MailSender::with_connector(ScriptedConnector {
            plain: b"220 relay.test ESMTP\r\n\
                     250-relay.test\r\n250-STARTTLS\r\n250 AUTH PLAIN\r\n\
                     220 2.0.0 Ready to start TLS\r\n",
            encrypted: b"250-relay.test\r\n250 AUTH PLAIN\r\n\
                      235 2.7.0 Authentication successful\r\n\
                      250 2.1.0 Ok\r\n\
                      250 2.1.5 Ok\r\n\
                      354 End data with <CR><LF>.<CR><LF>\r\n\
                      250 2.0.0 Ok: queued as 12345\r\n\
                      221 2.0.0 Bye\r\n",
        });
        let response = sender
            .send(&config(), &credentials(), &message())
            .await
            .unwrap();
        assert_eq!(response.first_line(), Some("2.0.0 Ok: queued as 12345"));
    }
}
