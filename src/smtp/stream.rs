use std::fmt::Display;
use std::future::Future;
use std::string::String;
use std::time::Duration;

use log::debug;
use tokio::io::{
    AsyncBufReadExt, AsyncRead as Read, AsyncReadExt, AsyncWrite as Write, AsyncWriteExt,
    BufReader,
};
use tokio::time::timeout;

use crate::codec::ClientCodec;
use crate::smtp::commands::*;
use crate::smtp::error::{Error, SmtpResult};
use crate::smtp::extension::ClientId;
use crate::smtp::response::parse_response;

/// Upper bound for the `QUIT` exchange, in seconds
const CLOSE_TIMEOUT: u64 = 5;

/// Upper bound for a whole reply, multi-line replies included
const MAX_RESPONSE_LENGTH: usize = 64 * 1024;

/// SMTP stream.
#[derive(Debug)]
pub struct SmtpStream<S: Read + Write + Unpin> {
    /// Inner stream.
    inner: BufReader<S>,
    /// Timeout applied to each command round trip
    timeout: Option<Duration>,
}

impl<S: Read + Write + Unpin> SmtpStream<S> {
    /// Creates new SMTP stream.
    pub fn new(stream: S) -> Self {
        Self {
            inner: BufReader::new(stream),
            timeout: None,
        }
    }

    /// Sets the timeout used for each command.
    pub fn set_timeout(&mut self, duration: Option<Duration>) {
        self.timeout = duration;
    }

    /// Returns inner stream.
    ///
    /// Should only be used when there are no unread responses,
    /// because the buffer of `BufReader` may be lost.
    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.inner.get_mut()
    }

    /// Reads the banner sent by the server once connected.
    pub async fn greeting(&mut self) -> SmtpResult {
        with_timeout(self.timeout, self.read_response()).await
    }

    /// Sends EHLO command and returns server response.
    pub async fn ehlo(&mut self, client_id: ClientId) -> SmtpResult {
        // Extended Hello
        let ehlo_response = self.command(EhloCommand::new(client_id)).await?;
        Ok(ehlo_response)
    }

    /// Send the given SMTP command to the server.
    pub async fn command(&mut self, command: impl Display) -> SmtpResult {
        with_timeout(self.timeout, async {
            self.write(command.to_string().as_bytes(), false).await?;
            self.read_response().await
        })
        .await
    }

    /// Like [`command`](Self::command), but keeps the command line out of the log.
    ///
    /// Used for `AUTH`, whose arguments are the encoded credentials.
    pub async fn sensitive_command(&mut self, command: impl Display) -> SmtpResult {
        with_timeout(self.timeout, async {
            self.write(command.to_string().as_bytes(), true).await?;
            self.read_response().await
        })
        .await
    }

    /// Writes the given data to the server.
    async fn write(&mut self, string: &[u8], redact: bool) -> Result<(), Error> {
        self.inner.get_mut().write_all(string).await?;
        self.inner.get_mut().flush().await?;

        if redact {
            debug!(">> <{} bytes redacted>", string.len());
        } else {
            debug!(
                ">> {}",
                escape_crlf(String::from_utf8_lossy(string).as_ref())
            );
        }
        Ok(())
    }

    /// Read an SMTP response from the wire.
    pub async fn read_response(&mut self) -> SmtpResult {
        let reader = &mut self.inner;
        let mut buffer = String::with_capacity(100);

        loop {
            let remaining = MAX_RESPONSE_LENGTH.saturating_sub(buffer.len());
            if remaining == 0 {
                return Err(Error::ResponseParsing("response too long"));
            }

            let read = (&mut *reader)
                .take(remaining as u64)
                .read_line(&mut buffer)
                .await?;
            if read == 0 {
                break;
            }
            debug!("<< {}", escape_crlf(&buffer[buffer.len() - read..]));
            match parse_response(&buffer) {
                Ok((_remaining, response)) => {
                    if response.is_positive() {
                        return Ok(response);
                    }

                    return Err(response.into());
                }
                Err(nom::Err::Failure(e)) => {
                    return Err(Error::Parsing(e.code));
                }
                Err(nom::Err::Incomplete(_)) => { /* read more */ }
                Err(nom::Err::Error(e)) => {
                    return Err(Error::Parsing(e.code));
                }
            }
        }

        Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "incomplete").into())
    }

    /// Sends the message content, followed by the end-of-data line.
    pub async fn message(&mut self, message: &[u8]) -> SmtpResult {
        let mut codec = ClientCodec::new();

        with_timeout(self.timeout, async {
            codec.encode(message, self.inner.get_mut()).await?;
            codec.encode(&[], self.inner.get_mut()).await?;
            self.inner.get_mut().flush().await?;

            debug!(
                ">> {}",
                escape_crlf(String::from_utf8_lossy(message).as_ref())
            );
            debug!(">> .<CRLF>");

            self.read_response().await
        })
        .await
    }

    /// Sends `QUIT` and shuts the stream down.
    ///
    /// The stream is shut down even if the server does not answer.
    pub async fn close(&mut self) -> Result<(), Error> {
        let quit = timeout(Duration::from_secs(CLOSE_TIMEOUT), self.command(QuitCommand)).await;
        let shutdown = self.inner.get_mut().shutdown().await;

        quit??;
        shutdown?;
        Ok(())
    }
}

/// Runs `future` under the optional deadline.
pub(crate) async fn with_timeout<T, F>(duration: Option<Duration>, future: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match duration {
        Some(duration) => timeout(duration, future).await?,
        None => future.await,
    }
}

/// Returns the string replacing all the CRLF with "\<CRLF\>"
/// Used for debug displays
fn escape_crlf(string: &str) -> String {
    string.replace("\r\n", "<CRLF>")
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{escape_crlf, SmtpStream};
    use crate::smtp::client::mock::MockStream;
    use crate::smtp::commands::StarttlsCommand;
    use crate::smtp::error::Error;

    #[test]
    fn test_escape_crlf() {
        assert_eq!(escape_crlf("\r\n"), "<CRLF>");
        assert_eq!(escape_crlf("EHLO my_name\r\n"), "EHLO my_name<CRLF>");
        assert_eq!(
            escape_crlf("EHLO my_name\r\nSIZE 42\r\n"),
            "EHLO my_name<CRLF>SIZE 42<CRLF>"
        );
    }

    #[tokio::test]
    async fn test_command_writes_and_reads() {
        let mock = MockStream::with_vec(b"220 2.0.0 Ready to start TLS\r\n".to_vec());
        let mut stream = SmtpStream::new(mock);

        let response = stream.command(StarttlsCommand).await.unwrap();
        assert!(response.has_code(220));
        assert_eq!(stream.get_mut().take_vec(), b"STARTTLS\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_multiline_response() {
        let mock = MockStream::with_vec(b"250-relay.test\r\n250-STARTTLS\r\n250 8BITMIME\r\n".to_vec());
        let mut stream = SmtpStream::new(mock);

        let response = stream.read_response().await.unwrap();
        assert_eq!(
            response.message,
            vec!["relay.test", "STARTTLS", "8BITMIME"]
        );
    }

    #[tokio::test]
    async fn test_negative_response() {
        let mock = MockStream::with_vec(b"454 4.7.0 TLS not available\r\n".to_vec());
        let mut stream = SmtpStream::new(mock);

        match stream.command(StarttlsCommand).await {
            Err(Error::Transient(response)) => assert!(response.has_code(454)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_response() {
        let mock = MockStream::with_vec(b"250-relay.test\r\n".to_vec());
        let mut stream = SmtpStream::new(mock);

        assert!(matches!(stream.read_response().await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_endless_response() {
        let mock = MockStream::with_vec(b"250-filler\r\n".repeat(10_000));
        let mut stream = SmtpStream::new(mock);

        assert!(matches!(
            stream.read_response().await,
            Err(Error::ResponseParsing("response too long"))
        ));
    }

    #[tokio::test]
    async fn test_garbage_response() {
        let mock = MockStream::with_vec(b"hello\r\n".to_vec());
        let mut stream = SmtpStream::new(mock);

        assert!(matches!(stream.read_response().await, Err(Error::Parsing(_))));
    }

    #[tokio::test]
    async fn test_message_is_stuffed_and_terminated() {
        let mock = MockStream::with_vec(b"250 2.0.0 Ok: queued\r\n".to_vec());
        let mut stream = SmtpStream::new(mock);
        stream.set_timeout(Some(Duration::from_secs(5)));

        let response = stream
            .message(b"Subject: Hi\r\n\r\n.leading dot")
            .await
            .unwrap();
        assert!(response.has_code(250));
        assert_eq!(
            stream.get_mut().take_vec(),
            b"Subject: Hi\r\n\r\n..leading dot\r\n.\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_close_sends_quit() {
        let mock = MockStream::with_vec(b"221 2.0.0 Bye\r\n".to_vec());
        let mut stream = SmtpStream::new(mock);

        stream.close().await.unwrap();
        assert_eq!(stream.get_mut().take_vec(), b"QUIT\r\n".to_vec());
    }
}
