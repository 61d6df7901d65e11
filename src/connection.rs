//! One-shot control-port connections.
//!
//! A [`ControlConnection`] is a single TCP connection to Tor's control port
//! that carries exactly one command. The command helpers in
//! [`commands`](crate::commands) open one, authenticate, write a line, read
//! the reply and drop it. Dropping the connection closes the socket on every
//! exit path.
//!
//! # Reply Shapes
//!
//! ```text
//!   250 OK                              ──► ["OK"]
//!
//!   250-SocksPort=9050                  ──► ["SocksPort=9050", "ExitNodes"]
//!   250 ExitNodes
//!
//!   250+ns/id/ABCD=                     ──► ["ns/id/ABCD=", "r moria1 ...",
//!   r moria1 ...                              "s Authority ..."]
//!   s Authority ...
//!   .
//!   250 OK
//! ```
//!
//! The final `250 OK` that closes a multi-line reply is dropped. Data-block
//! lines are de-dot-stuffed and the terminating `.` is not kept.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::client::SecurePassword;
use crate::codec::{is_success_code, quote_string, ReplyLine, Separator};
use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::logger::plog;

/// Where the control port lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct ControlEndpoint {
    /// Host name or IP address of the control port.
    pub host: String,
    /// Control port number.
    pub port: u16,
    /// Password sent with AUTHENTICATE; may be empty.
    pub password: SecurePassword,
}

impl ControlEndpoint {
    /// Creates an endpoint for an arbitrary host.
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: SecurePassword::new(password.into()),
        }
    }

    /// Creates an endpoint on `127.0.0.1`.
    pub fn local(port: u16, password: impl Into<String>) -> Self {
        Self::new("127.0.0.1", port, password)
    }

    /// Returns `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// One complete reply read from the control port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionResponse {
    /// Status code of the last reply line.
    pub status_code: u16,
    /// Reply texts with codes and separators stripped.
    pub responses: Vec<String>,
}

impl ConnectionResponse {
    /// Returns true for a 2xx status code.
    pub fn success(&self) -> bool {
        is_success_code(self.status_code)
    }

    /// Reply texts joined with spaces, for error reporting.
    pub fn message(&self) -> String {
        self.responses.join(" ")
    }

    /// Turns a non-2xx reply into [`Error::Command`].
    pub fn into_result(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::Command {
                code: self.status_code,
                message: self.message(),
            })
        }
    }
}

/// A single-command connection to the control port.
pub struct ControlConnection {
    stream: BufReader<TcpStream>,
}

impl ControlConnection {
    /// Opens the TCP connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if the socket cannot be opened.
    pub async fn connect(endpoint: &ControlEndpoint) -> Result<Self> {
        let address = endpoint.address();
        let socket = TcpStream::connect(&address)
            .await
            .map_err(|e| Error::Connect(format!("{}: {}", address, e)))?;
        Ok(Self {
            stream: BufReader::new(socket),
        })
    }

    /// Connects and authenticates in one step.
    pub async fn open(endpoint: &ControlEndpoint) -> Result<Self> {
        let mut connection = Self::connect(endpoint).await?;
        connection.authenticate(endpoint.password.as_str()).await?;
        Ok(connection)
    }

    /// Sends `AUTHENTICATE "<password>"` and checks for a 250 reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] when Tor rejects the password.
    pub async fn authenticate(&mut self, password: &str) -> Result<()> {
        self.write_line(&format!("AUTHENTICATE {}", quote_string(password)))
            .await?;
        let response = self.read_response().await?;
        if response.status_code != 250 {
            return Err(Error::Authentication(response.message()));
        }
        Ok(())
    }

    /// Writes one CRLF-terminated line.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let socket = self.stream.get_mut();
        socket.write_all(line.as_bytes()).await?;
        socket.write_all(b"\r\n").await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads one complete reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the connection closes mid-reply or a
    /// line does not carry a status code.
    pub async fn read_response(&mut self) -> Result<ConnectionResponse> {
        let mut response = ConnectionResponse::default();

        loop {
            let line = self.read_line().await?;
            let reply = ReplyLine::parse(&line)
                .ok_or_else(|| Error::Protocol(format!("malformed reply line: {:?}", line)))?;
            response.status_code = reply.code;

            match reply.separator {
                Separator::Continuation => response.responses.push(reply.text.to_string()),
                Separator::Data => {
                    response.responses.push(reply.text.to_string());
                    loop {
                        let body = self.read_line().await?;
                        if body == "." {
                            break;
                        }
                        let unstuffed = body.strip_prefix('.').filter(|b| b.starts_with('.'));
                        response
                            .responses
                            .push(unstuffed.unwrap_or(&body).to_string());
                    }
                }
                Separator::End => {
                    let closes_block =
                        !response.responses.is_empty() && reply.text.eq_ignore_ascii_case("OK");
                    if !closes_block {
                        response.responses.push(reply.text.to_string());
                    }
                    break;
                }
            }
        }

        Ok(response)
    }

    /// Writes `line` and reads its reply.
    pub async fn execute(&mut self, line: &str) -> Result<ConnectionResponse> {
        plog(LogLevel::Debug, &format!("control command: {}", redact(line)));
        self.write_line(line).await?;
        self.read_response().await
    }

    /// Releases the socket along with any bytes already buffered from it.
    pub(crate) fn into_parts(self) -> (Vec<u8>, TcpStream) {
        let buffered = self.stream.buffer().to_vec();
        (buffered, self.stream.into_inner())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await?;
        if read == 0 {
            return Err(Error::Protocol(
                "connection closed before the reply completed".to_string(),
            ));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(line)
    }
}

fn redact(line: &str) -> &str {
    if line
        .get(..12)
        .is_some_and(|verb| verb.eq_ignore_ascii_case("AUTHENTICATE"))
    {
        "AUTHENTICATE [REDACTED]"
    } else {
        line
    }
}
