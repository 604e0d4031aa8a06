//! PostgreSQL replication client
//!
//! Minimal TCP frontend for the streaming replication subprotocol. Speaks
//! just enough of the startup and simple-query flows to authenticate
//! (cleartext or MD5), run `IDENTIFY_SYSTEM`, and enter copy-both mode with
//! `START_REPLICATION`. Uses `postgres-protocol` for message framing.

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::POSTGRES_EPOCH_UNIX_SECS;
use crate::common::{parse_lsn, Validator, CONNECTION_TIMEOUT_SECS, IO_TIMEOUT_SECS};

/// Result of an `IDENTIFY_SYSTEM` round trip.
#[derive(Debug, Clone)]
pub struct IdentifySystem {
    pub system_id: String,
    pub timeline: i32,
    /// Current WAL write position, if the server reported a parseable LSN.
    pub xlog_pos: Option<u64>,
    pub database: Option<String>,
}

/// Connected replication session, pre copy-both.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
}

impl ReplicationClient {
    /// Connect and authenticate with `replication=database` in the startup
    /// parameters. Supports trust, cleartext, and MD5 authentication.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        Validator::validate_identifier(user)?;
        Validator::validate_identifier(database)?;

        info!(host, port, user, database, "connecting for replication");
        let stream = timeout(
            Duration::from_secs(CONNECTION_TIMEOUT_SECS),
            TcpStream::connect((host, port)),
        )
        .await
        .with_context(|| format!("connect timeout after {CONNECTION_TIMEOUT_SECS}s"))??;
        let mut stream = BufReader::new(stream);

        let params = vec![
            ("user", user),
            ("database", database),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)?;
        write_all(&mut stream, &buf).await?;

        loop {
            let (code, body) = read_message(&mut stream).await?;

            let mut raw = BytesMut::with_capacity(5 + body.len());
            raw.put_u8(code);
            raw.put_i32((body.len() + 4) as i32);
            raw.put_slice(&body);
            let message = backend::Message::parse(&mut raw)?
                .ok_or_else(|| anyhow!("incomplete authentication message"))?;

            match message {
                backend::Message::AuthenticationOk => {
                    debug!("authenticated");
                    break;
                }
                backend::Message::AuthenticationCleartextPassword => {
                    warn!("server requested cleartext password authentication");
                    let pass =
                        password.ok_or_else(|| anyhow!("password required but not configured"))?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(pass.as_bytes(), &mut buf)?;
                    write_all(&mut stream, &buf).await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let pass =
                        password.ok_or_else(|| anyhow!("password required but not configured"))?;
                    let hashed = hash_md5_password(user, pass, &body.salt());
                    let mut buf = BytesMut::new();
                    frontend::password_message(hashed.as_bytes(), &mut buf)?;
                    write_all(&mut stream, &buf).await?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    bail!("SASL authentication is not supported; allow md5 for this role")
                }
                backend::Message::ErrorResponse(_) => bail!("server rejected authentication"),
                _ => bail!("unexpected message {code:#04x} during authentication"),
            }
        }

        // ParameterStatus and BackendKeyData precede ReadyForQuery.
        loop {
            let (code, _) = read_message(&mut stream).await?;
            match code {
                b'Z' => break,
                b'E' => bail!("server error before ready-for-query"),
                _ => {}
            }
        }

        Ok(Self { stream })
    }

    /// Run `IDENTIFY_SYSTEM` and parse the single result row.
    pub async fn identify_system(&mut self) -> Result<IdentifySystem> {
        let rows = self.simple_query_rows("IDENTIFY_SYSTEM").await?;
        parse_identify_system(&rows)
    }

    /// Issue `START_REPLICATION`, consuming the client. On success the
    /// connection is in copy-both mode and only fit for streaming.
    pub async fn start_replication(
        mut self,
        slot: &str,
        publication: &str,
        start_lsn: u64,
        protocol_version: u8,
    ) -> Result<ReplicationStream> {
        Validator::validate_identifier(slot)?;
        Validator::validate_identifier(publication)?;

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '{}', publication_names '{}')",
            slot,
            format_lsn(start_lsn),
            protocol_version,
            publication
        );
        debug!(query = %query, "entering replication mode");

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        write_all(&mut self.stream, &buf).await?;

        let (code, _) = read_message(&mut self.stream).await?;
        match code {
            b'W' => {
                info!(slot, publication, lsn = %format_lsn(start_lsn), "copy-both stream established");
                Ok(ReplicationStream {
                    stream: self.stream,
                })
            }
            b'E' => bail!("server refused START_REPLICATION for slot {slot}"),
            other => bail!("unexpected response {other:#04x} to START_REPLICATION"),
        }
    }

    /// Simple-query protocol, collecting DataRow fields as text.
    async fn simple_query_rows(&mut self, query: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        write_all(&mut self.stream, &buf).await?;

        let mut rows = Vec::new();
        loop {
            let (code, body) = read_message(&mut self.stream).await?;
            match code {
                b'D' => rows.push(parse_data_row(Bytes::from(body))?),
                b'Z' => break,
                b'E' => bail!("server error running {query}"),
                // RowDescription, CommandComplete, NoticeResponse
                _ => {}
            }
        }
        Ok(rows)
    }
}

/// Copy-both session delivering raw replication frames.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Next CopyData payload; `None` once the server sends CopyDone.
    ///
    /// No read timeout here: an idle stream parks until the server's next
    /// keepalive. Closing the connection unblocks the read with an error.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let code = self
            .stream
            .read_u8()
            .await
            .context("stream closed while reading frame type")?;
        let len = self
            .stream
            .read_i32()
            .await
            .context("stream closed while reading frame length")?;
        if len < 4 {
            bail!("invalid frame length {len}");
        }
        let len = len as usize;
        Validator::validate_frame_size(len)?;

        let mut body = vec![0u8; len - 4];
        self.stream
            .read_exact(&mut body)
            .await
            .context("stream closed mid-frame")?;

        match code {
            b'd' => Ok(Some(Bytes::from(body))),
            b'c' => Ok(None),
            b'E' => bail!("replication stream error reported by server"),
            other => bail!("unexpected frame type {other:#04x} in copy-both mode"),
        }
    }

    /// Standby status update confirming everything up to `lsn` as written,
    /// flushed, and applied.
    pub async fn send_status_update(&mut self, lsn: u64) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_i64(pg_epoch_micros());
        payload.put_u8(0); // no reply requested

        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.stream.get_mut().write_all(&frame).await?;
        self.stream.get_mut().flush().await?;
        Ok(())
    }
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let (code, len) = timeout(Duration::from_secs(IO_TIMEOUT_SECS), async {
        let code = stream.read_u8().await?;
        let len = stream.read_i32().await?;
        Ok::<_, std::io::Error>((code, len))
    })
    .await
    .context("read timeout")??;

    if len < 4 {
        bail!("invalid message length {len}");
    }
    let len = len as usize;
    Validator::validate_frame_size(len)?;

    let mut body = vec![0u8; len - 4];
    timeout(
        Duration::from_secs(IO_TIMEOUT_SECS),
        stream.read_exact(&mut body),
    )
    .await
    .context("read timeout")??;

    Ok((code, body))
}

async fn write_all(stream: &mut BufReader<TcpStream>, data: &[u8]) -> Result<()> {
    timeout(Duration::from_secs(IO_TIMEOUT_SECS), async {
        stream.get_mut().write_all(data).await?;
        stream.get_mut().flush().await?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .context("write timeout")??;
    Ok(())
}

fn parse_data_row(mut body: Bytes) -> Result<Vec<Option<String>>> {
    if body.remaining() < 2 {
        bail!("short DataRow");
    }
    let count = body.get_u16() as usize;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        if body.remaining() < 4 {
            bail!("short DataRow field header");
        }
        let len = body.get_i32();
        if len < 0 {
            fields.push(None);
            continue;
        }
        let len = len as usize;
        if body.remaining() < len {
            bail!("short DataRow field");
        }
        let raw = body.copy_to_bytes(len);
        fields.push(Some(String::from_utf8_lossy(&raw).into_owned()));
    }
    Ok(fields)
}

fn parse_identify_system(rows: &[Vec<Option<String>>]) -> Result<IdentifySystem> {
    let row = rows
        .first()
        .ok_or_else(|| anyhow!("IDENTIFY_SYSTEM returned no rows"))?;
    let field = |i: usize| row.get(i).cloned().flatten();

    Ok(IdentifySystem {
        system_id: field(0).ok_or_else(|| anyhow!("IDENTIFY_SYSTEM missing systemid"))?,
        timeline: field(1).and_then(|t| t.parse().ok()).unwrap_or(0),
        xlog_pos: field(2).as_deref().and_then(parse_lsn),
        database: field(3),
    })
}

fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

fn pg_epoch_micros() -> i64 {
    let pg_epoch =
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(POSTGRES_EPOCH_UNIX_SECS as u64);
    SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn hash_md5_password(user: &str, pass: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pass);
    hasher.update(user);
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}
