use std::io;

use tokio::io::{AsyncWrite as Write, AsyncWriteExt};

/// Progress through a `CRLF .` sequence
const NONE: u8 = 0;
const CR: u8 = 1;
const LINE_START: u8 = 2;
const DOT: u8 = 3;

/// The codec used for transparency
#[derive(Clone, Copy, Debug)]
pub struct ClientCodec {
    escape_count: u8,
}

impl Default for ClientCodec {
    /// The data section starts at the beginning of a line.
    fn default() -> Self {
        ClientCodec {
            escape_count: LINE_START,
        }
    }
}

impl ClientCodec {
    /// Creates a new client codec
    pub fn new() -> Self {
        ClientCodec::default()
    }
}

impl ClientCodec {
    /// Adds transparency.
    ///
    /// An empty frame ends the data section with the `.` terminator line.
    pub async fn encode<W: Write + Unpin>(&mut self, frame: &[u8], mut buf: W) -> io::Result<()> {
        match frame.len() {
            0 => {
                match self.escape_count {
                    NONE => buf.write_all(b"\r\n.\r\n").await?,
                    CR => buf.write_all(b"\n.\r\n").await?,
                    LINE_START => buf.write_all(b".\r\n").await?,
                    _ => unreachable!(),
                }
                self.escape_count = LINE_START;
                Ok(())
            }
            _ => {
                let mut start = 0;
                for (idx, byte) in frame.iter().enumerate() {
                    self.escape_count = match (self.escape_count, *byte) {
                        (LINE_START, b'.') => DOT,
                        (NONE, b'\r') | (LINE_START, b'\r') => CR,
                        (CR, b'\n') => LINE_START,
                        (CR, b'\r') => CR,
                        _ => NONE,
                    };
                    if self.escape_count == DOT {
                        self.escape_count = NONE;
                        buf.write_all(&frame[start..idx]).await?;
                        buf.write_all(b".").await?;
                        start = idx;
                    }
                }
                buf.write_all(&frame[start..]).await?;
                Ok(())
            }
        }
    }
}
