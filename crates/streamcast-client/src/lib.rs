//! Client-side session for the Streamcast wire protocol.
//!
//! A [`Session`] owns one line-framed TCP connection to a server and
//! exposes typed send/receive plus small conveniences for the common
//! client commands. Redirect handling is left to the caller: on
//! [`Message::Redirect`] open a new session against the indicated
//! server and present `CLIENT_AUTHENTICATE`.

use streamcast_core::{decode, Activity, DecodeError, Message};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("server closed the connection")]
    Closed,
    #[error("undecodable line from server: {0}")]
    Decode(#[from] DecodeError),
}

/// Receiving half of a session.
pub struct SessionReader {
    reader: BufReader<OwnedReadHalf>,
}

impl SessionReader {
    /// Receive the next protocol message, skipping blank lines.
    pub async fn recv(&mut self) -> Result<Message, SessionError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(SessionError::Closed);
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            return Ok(decode(trimmed)?);
        }
    }
}

/// Sending half of a session.
pub struct SessionWriter {
    writer: OwnedWriteHalf,
}

impl SessionWriter {
    /// Send one protocol message.
    pub async fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        let mut line = msg.encode();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Fire-and-forget: the server replies only with broadcasts to
    /// *other* connections, never an ack to this one.
    pub async fn send_activity(
        &mut self,
        username: &str,
        secret: &str,
        object: &str,
    ) -> Result<(), SessionError> {
        self.send(&Message::ActivityMessage {
            username: Some(username.to_owned()),
            secret: Some(secret.to_owned()),
            activity: Some(Activity::new(object)),
        })
        .await
    }

    pub async fn logout(&mut self, username: &str, secret: &str) -> Result<(), SessionError> {
        self.send(&Message::Logout {
            username: Some(username.to_owned()),
            secret: Some(secret.to_owned()),
        })
        .await
    }
}

/// One live connection to a Streamcast server.
pub struct Session {
    reader: SessionReader,
    writer: SessionWriter,
}

impl Session {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: SessionReader {
                reader: BufReader::new(read_half),
            },
            writer: SessionWriter { writer: write_half },
        })
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        self.writer.send(msg).await
    }

    pub async fn recv(&mut self) -> Result<Message, SessionError> {
        self.reader.recv().await
    }

    pub async fn login(
        &mut self,
        username: &str,
        secret: &str,
    ) -> Result<Message, SessionError> {
        self.send(&Message::Login {
            username: Some(username.to_owned()),
            secret: Some(secret.to_owned()),
        })
        .await?;
        self.recv().await
    }

    pub async fn register(
        &mut self,
        username: &str,
        secret: &str,
    ) -> Result<Message, SessionError> {
        self.send(&Message::Register {
            username: Some(username.to_owned()),
            secret: Some(secret.to_owned()),
        })
        .await?;
        self.recv().await
    }

    /// Re-admit after a REDIRECT, presenting the redirecting server's id.
    pub async fn client_authenticate(
        &mut self,
        username: &str,
        secret: &str,
        id: &str,
    ) -> Result<Message, SessionError> {
        self.send(&Message::ClientAuthenticate {
            username: Some(username.to_owned()),
            secret: Some(secret.to_owned()),
            id: Some(id.to_owned()),
        })
        .await?;
        self.recv().await
    }

    pub async fn send_activity(
        &mut self,
        username: &str,
        secret: &str,
        object: &str,
    ) -> Result<(), SessionError> {
        self.writer.send_activity(username, secret, object).await
    }

    pub async fn request_all(
        &mut self,
        username: &str,
        secret: &str,
    ) -> Result<Message, SessionError> {
        self.send(&Message::RequestAll {
            username: Some(username.to_owned()),
            secret: Some(secret.to_owned()),
            all_activity_message: None,
        })
        .await?;
        self.recv().await
    }

    pub async fn logout(&mut self, username: &str, secret: &str) -> Result<(), SessionError> {
        self.writer.logout(username, secret).await
    }

    /// Split into independently-owned halves, so receiving can be
    /// select!-ed against other work while the writer stays usable.
    pub fn into_split(self) -> (SessionReader, SessionWriter) {
        (self.reader, self.writer)
    }
}
