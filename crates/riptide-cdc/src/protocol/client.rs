//! Replication-mode Postgres client.
//!
//! Speaks just enough of the frontend/backend protocol over TCP to
//! authenticate (cleartext and MD5), run simple queries for slot and
//! publication management, and enter CopyBoth streaming mode. Message
//! framing for the handshake reuses `postgres-protocol`.

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use riptide_core::Lsn;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{CdcError, Result};

/// Microseconds between the Unix epoch and the Postgres epoch
/// (2000-01-01T00:00:00Z).
const PG_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// A connected replication-mode session, ready for queries or streaming.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    /// Opens a TCP connection and completes the startup handshake with
    /// `replication=database`, so replication commands are accepted
    /// alongside simple queries.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        info!(host, port, user, database, "connecting for replication");
        let stream = TcpStream::connect((host, port)).await?;
        let mut client = Self {
            stream: BufReader::new(stream),
        };

        let params = vec![
            ("user", user),
            ("database", database),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)?;
        client.send(&buf).await?;

        client.authenticate(user, password).await?;

        // Drain parameter status and backend-key messages until the
        // server is ready.
        loop {
            let (tag, _body) = client.read_message().await?;
            match tag {
                b'Z' => break,
                b'E' => return Err(CdcError::protocol("error while waiting for ready")),
                _ => {}
            }
        }

        debug!("replication session established");
        Ok(client)
    }

    async fn authenticate(&mut self, user: &str, password: Option<&str>) -> Result<()> {
        loop {
            let (tag, body) = self.read_message().await?;

            let mut raw = BytesMut::with_capacity(1 + 4 + body.len());
            raw.put_u8(tag);
            raw.put_i32((body.len() + 4) as i32);
            raw.put_slice(&body);

            let message = backend::Message::parse(&mut raw)
                .map_err(|e| CdcError::Auth(e.to_string()))?
                .ok_or_else(|| CdcError::Auth("incomplete auth message".to_string()))?;

            match message {
                backend::Message::AuthenticationOk => {
                    debug!("authenticated");
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let password = password
                        .ok_or_else(|| CdcError::Auth("password required".to_string()))?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(password.as_bytes(), &mut buf)?;
                    self.send(&buf).await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let password = password
                        .ok_or_else(|| CdcError::Auth("password required".to_string()))?;
                    let response = md5_password(user, password, &body.salt());
                    let mut buf = BytesMut::new();
                    frontend::password_message(response.as_bytes(), &mut buf)?;
                    self.send(&buf).await?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    return Err(CdcError::Auth(
                        "SASL authentication is not supported; use md5 or trust".to_string(),
                    ));
                }
                backend::Message::ErrorResponse(_) => {
                    return Err(CdcError::Auth(error_message(&body)));
                }
                _ => {
                    return Err(CdcError::Auth(format!(
                        "unexpected message 0x{tag:02X} during auth"
                    )));
                }
            }
        }
    }

    /// Runs a simple query and collects any data rows as text columns.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(sql, &mut buf)?;
        self.send(&buf).await?;

        let mut rows = Vec::new();
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'D' => rows.push(parse_data_row(&body)?),
                b'Z' => break,
                b'E' => {
                    let message = error_message(&body);
                    // Still drain to ReadyForQuery so the session stays usable.
                    loop {
                        let (tag, _body) = self.read_message().await?;
                        if tag == b'Z' {
                            break;
                        }
                    }
                    return Err(CdcError::Server(message));
                }
                // RowDescription, CommandComplete, notices.
                _ => {}
            }
        }
        Ok(rows)
    }

    /// Issues START_REPLICATION and hands the connection over to
    /// streaming once the server answers with CopyBothResponse.
    pub async fn start_replication(
        mut self,
        slot: &str,
        start_lsn: Lsn,
        publication: &str,
    ) -> Result<ReplicationStream> {
        let sql = format!(
            "START_REPLICATION SLOT {slot} LOGICAL {start_lsn} \
             (proto_version '1', publication_names '{publication}')"
        );
        let mut buf = BytesMut::new();
        frontend::query(&sql, &mut buf)?;
        self.send(&buf).await?;

        let (tag, body) = self.read_message().await?;
        match tag {
            b'W' => {
                info!(slot, %start_lsn, publication, "entered CopyBoth mode");
                Ok(ReplicationStream {
                    stream: self.stream,
                })
            }
            b'E' => Err(CdcError::Server(error_message(&body))),
            other => Err(CdcError::protocol(format!(
                "unexpected response to START_REPLICATION: 0x{other:02X}"
            ))),
        }
    }

    async fn read_message(&mut self) -> Result<(u8, Vec<u8>)> {
        read_backend_message(&mut self.stream).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.get_mut().write_all(data).await?;
        self.stream.get_mut().flush().await?;
        Ok(())
    }
}

/// The CopyBoth streaming half: CopyData frames in, status updates out.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Next CopyData payload, or `None` when the server ends the copy
    /// stream.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let (tag, body) = read_backend_message(&mut self.stream).await?;
        match tag {
            b'd' => Ok(Some(Bytes::from(body))),
            b'c' => Ok(None),
            b'E' => Err(CdcError::Server(error_message(&body))),
            other => Err(CdcError::protocol(format!(
                "unexpected message 0x{other:02X} in copy stream"
            ))),
        }
    }

    /// Sends a standby status update (`'r'`) echoing the given position
    /// as written, flushed, and applied, with the current wall time.
    pub async fn send_status_update(&mut self, lsn: Lsn) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn.as_u64());
        payload.put_u64(lsn.as_u64());
        payload.put_u64(lsn.as_u64());
        payload.put_i64(pg_clock_micros());
        payload.put_u8(0);

        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.get_mut().write_all(&frame).await?;
        self.stream.get_mut().flush().await?;
        Ok(())
    }
}

async fn read_backend_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let tag = stream.read_u8().await?;
    let len = stream.read_i32().await?;
    if len < 4 {
        return Err(CdcError::protocol(format!("invalid message length {len}")));
    }
    let mut body = vec![0u8; len as usize - 4];
    stream.read_exact(&mut body).await?;
    Ok((tag, body))
}

/// DataRow body: u16 column count, then per column an i32 length (-1 for
/// NULL) followed by that many bytes of text.
fn parse_data_row(body: &[u8]) -> Result<Vec<Option<String>>> {
    let truncated = || CdcError::protocol("truncated DataRow".to_string());

    if body.len() < 2 {
        return Err(truncated());
    }
    let count = u16::from_be_bytes([body[0], body[1]]) as usize;
    let mut pos = 2;
    let mut columns = Vec::with_capacity(count);

    for _ in 0..count {
        let len_bytes: [u8; 4] = body
            .get(pos..pos + 4)
            .ok_or_else(truncated)?
            .try_into()
            .map_err(|_| truncated())?;
        pos += 4;
        let len = i32::from_be_bytes(len_bytes);
        if len < 0 {
            columns.push(None);
            continue;
        }
        let end = pos + len as usize;
        let value = body.get(pos..end).ok_or_else(truncated)?;
        columns.push(Some(String::from_utf8_lossy(value).into_owned()));
        pos = end;
    }

    Ok(columns)
}

/// Microseconds since the Postgres epoch, for status-update timestamps.
fn pg_clock_micros() -> i64 {
    let pg_epoch =
        std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(PG_EPOCH_UNIX_SECS);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// MD5 password response: `md5(md5(password + user) + salt)`.
fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password);
    hasher.update(user);
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

/// Extracts the human-readable message field from an ErrorResponse body.
fn error_message(body: &[u8]) -> String {
    let mut pos = 0;
    while pos < body.len() && body[pos] != 0 {
        let field = body[pos];
        pos += 1;
        let end = match body[pos..].iter().position(|&b| b == 0) {
            Some(end) => pos + end,
            None => break,
        };
        if field == b'M' {
            if let Ok(message) = std::str::from_utf8(&body[pos..end]) {
                return message.to_string();
            }
        }
        pos = end + 1;
    }
    "error response from server".to_string()
}
