//! MySQL binlog wire client
//!
//! Minimal TCP frontend for the replication side of the MySQL client/server
//! protocol: the version 10 handshake with `mysql_native_password` and
//! `caching_sha2_password` authentication, `COM_QUERY` for session setup
//! statements, `COM_REGISTER_SLAVE`, and `COM_BINLOG_DUMP`. Catalog queries
//! go through `mysql_async` elsewhere; this client only ever has to read
//! OK/ERR responses and the binlog event stream.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::common::{Validator, CONNECTION_TIMEOUT_SECS, IO_TIMEOUT_SECS};

/// Payloads of exactly this size continue in the next packet.
const MAX_PACKET_SIZE: usize = 0xFF_FFFF;

/// utf8mb4_general_ci, accepted by every 5.7+ server.
const UTF8MB4_CHARSET: u8 = 45;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

/// Fields of the server's initial handshake packet (protocol version 10).
#[derive(Debug)]
struct Handshake {
    server_version: String,
    connection_id: u32,
    capabilities: u32,
    auth_plugin: String,
    /// Both scramble parts concatenated, trailing nul trimmed.
    nonce: Vec<u8>,
}

/// Connected binlog session, pre dump.
pub struct BinlogClient {
    stream: BufReader<TcpStream>,
    sequence: u8,
    server_version: String,
    connection_id: u32,
}

impl BinlogClient {
    /// Connect and authenticate. The account needs `REPLICATION SLAVE` and
    /// `REPLICATION CLIENT` privileges for the dump commands to succeed.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: Option<&str>,
        database: Option<&str>,
    ) -> Result<Self> {
        // Account names may carry dots and dashes; they travel in
        // length-prefixed protocol fields, never interpolated into SQL.
        if user.is_empty() {
            bail!("replication user cannot be empty");
        }
        if let Some(db) = database {
            Validator::validate_identifier(db)?;
        }

        info!(host, port, user, "connecting for binlog streaming");
        let stream = timeout(
            Duration::from_secs(CONNECTION_TIMEOUT_SECS),
            TcpStream::connect((host, port)),
        )
        .await
        .with_context(|| format!("connect timeout after {CONNECTION_TIMEOUT_SECS}s"))??;

        let mut client = Self {
            stream: BufReader::new(stream),
            sequence: 0,
            server_version: String::new(),
            connection_id: 0,
        };

        let payload = client.read_packet_timed().await?;
        if payload.first() == Some(&0xFF) {
            bail!("server rejected connection: {}", parse_server_error(&payload));
        }
        let handshake = parse_handshake(&payload)?;
        debug!(
            version = %handshake.server_version,
            connection_id = handshake.connection_id,
            capabilities = handshake.capabilities,
            plugin = %handshake.auth_plugin,
            "received server handshake"
        );
        client.server_version = handshake.server_version.clone();
        client.connection_id = handshake.connection_id;

        client
            .authenticate(user, password.unwrap_or(""), database, &handshake)
            .await?;
        info!(version = %client.server_version, "binlog connection authenticated");
        Ok(client)
    }

    /// Server version string from the handshake, e.g. `8.0.36` or
    /// `10.11.6-MariaDB`.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Connection id assigned by the server, as shown in `SHOW PROCESSLIST`.
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Run a statement for its side effect. Result sets are not read, only
    /// OK and ERR responses matter; session variable assignments never
    /// return rows.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        debug!(sql, "running session statement");
        self.sequence = 0;
        let mut payload = Vec::with_capacity(1 + sql.len());
        payload.push(COM_QUERY);
        payload.extend_from_slice(sql.as_bytes());
        self.write_packet(&payload).await?;

        let response = self.read_packet_timed().await?;
        match response.first().copied() {
            Some(0x00) => Ok(()),
            Some(0xFF) => bail!("statement failed: {}", parse_server_error(&response)),
            _ => {
                warn!(sql, "statement returned a result set this client does not read");
                Ok(())
            }
        }
    }

    /// `COM_REGISTER_SLAVE`, announcing this connection as a replica so it
    /// shows up in `SHOW REPLICAS`. Some servers require it before a dump.
    pub async fn register_replica(&mut self, server_id: u32) -> Result<()> {
        self.sequence = 0;
        let mut payload = BytesMut::with_capacity(18);
        payload.put_u8(COM_REGISTER_SLAVE);
        payload.put_u32_le(server_id);
        payload.put_u8(0); // hostname, unreported
        payload.put_u8(0); // user
        payload.put_u8(0); // password
        payload.put_u16_le(0); // port
        payload.put_u32_le(0); // replication rank, unused
        payload.put_u32_le(0); // source id
        self.write_packet(&payload).await?;

        let response = self.read_packet_timed().await?;
        match response.first().copied() {
            Some(0x00) => {
                debug!(server_id, "registered as replica");
                Ok(())
            }
            Some(0xFF) => bail!(
                "replica registration failed: {}",
                parse_server_error(&response)
            ),
            other => bail!("unexpected response {other:?} to replica registration"),
        }
    }

    /// `COM_BINLOG_DUMP` from the given file and offset, consuming the
    /// client. On success the connection carries only binlog events from
    /// here on.
    pub async fn start_dump(
        mut self,
        server_id: u32,
        file: &str,
        offset: u32,
    ) -> Result<BinlogStream> {
        self.sequence = 0;
        let mut payload = BytesMut::with_capacity(11 + file.len());
        payload.put_u8(COM_BINLOG_DUMP);
        payload.put_u32_le(offset);
        payload.put_u16_le(0); // flags: block at EOF instead of ending the dump
        payload.put_u32_le(server_id);
        payload.put_slice(file.as_bytes());
        self.write_packet(&payload).await?;

        info!(file, offset, server_id, "binlog dump started");
        Ok(BinlogStream { client: self })
    }

    /// Read one protocol packet, reassembling payloads that span packets.
    /// No timeout; see `read_packet_timed` for the command path.
    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream
                .read_exact(&mut header)
                .await
                .context("connection closed while reading packet header")?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            Validator::validate_frame_size(start + len)?;
            payload.resize(start + len, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .context("connection closed mid-packet")?;

            if len < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    /// `read_packet` under the I/O timeout, for handshake and command
    /// responses where the server is expected to answer promptly.
    async fn read_packet_timed(&mut self) -> Result<Vec<u8>> {
        timeout(Duration::from_secs(IO_TIMEOUT_SECS), self.read_packet())
            .await
            .context("read timeout")?
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() >= MAX_PACKET_SIZE {
            bail!("outbound packet too large: {} bytes", payload.len());
        }
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        frame.put_u8(self.sequence);
        frame.put_slice(payload);
        self.sequence = self.sequence.wrapping_add(1);

        timeout(Duration::from_secs(IO_TIMEOUT_SECS), async {
            self.stream.get_mut().write_all(&frame).await?;
            self.stream.get_mut().flush().await?;
            Ok::<_, std::io::Error>(())
        })
        .await
        .context("write timeout")??;
        Ok(())
    }

    async fn authenticate(
        &mut self,
        user: &str,
        password: &str,
        database: Option<&str>,
        handshake: &Handshake,
    ) -> Result<()> {
        let scramble = scramble_password(&handshake.auth_plugin, password, &handshake.nonce)?;

        let mut flags = CLIENT_PROTOCOL_41
            | CLIENT_LONG_PASSWORD
            | CLIENT_TRANSACTIONS
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH
            | CLIENT_DEPRECATE_EOF;
        if database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }

        let mut payload = BytesMut::with_capacity(128);
        payload.put_u32_le(flags);
        payload.put_u32_le(MAX_PACKET_SIZE as u32);
        payload.put_u8(UTF8MB4_CHARSET);
        payload.put_bytes(0, 23);
        payload.put_slice(user.as_bytes());
        payload.put_u8(0);
        payload.put_u8(scramble.len() as u8);
        payload.put_slice(&scramble);
        if let Some(db) = database {
            payload.put_slice(db.as_bytes());
            payload.put_u8(0);
        }
        payload.put_slice(handshake.auth_plugin.as_bytes());
        payload.put_u8(0);
        self.write_packet(&payload).await?;

        loop {
            let response = self.read_packet_timed().await?;
            match response.first().copied() {
                Some(0x00) => return Ok(()),
                // Fast-auth result from caching_sha2_password: 0x03 means
                // the server had a cached entry and an OK packet follows.
                Some(0x01) => match response.get(1).copied() {
                    Some(0x03) => continue,
                    Some(0x04) => bail!(
                        "caching_sha2_password requires full authentication over an \
                         insecure channel; authenticate this account once with another \
                         client to seed the server cache, or switch it to \
                         mysql_native_password"
                    ),
                    other => bail!("unexpected fast-auth marker {other:?}"),
                },
                Some(0xFE) => {
                    let (plugin, nonce) = parse_auth_switch(&response)?;
                    debug!(plugin = %plugin, "server requested auth plugin switch");
                    let scramble = scramble_password(&plugin, password, &nonce)?;
                    self.write_packet(&scramble).await?;
                }
                Some(0xFF) => {
                    bail!("authentication failed: {}", parse_server_error(&response))
                }
                other => bail!("unexpected byte {other:?} in authentication response"),
            }
        }
    }
}

/// Established dump session delivering raw binlog event frames.
pub struct BinlogStream {
    client: BinlogClient,
}

impl BinlogStream {
    /// Next event frame, starting at the event header; `None` once the
    /// server ends the dump with EOF.
    ///
    /// No read timeout here: an idle stream parks until the next event or
    /// server heartbeat. Closing the connection unblocks the read with an
    /// error.
    pub async fn next_event(&mut self) -> Result<Option<Bytes>> {
        let packet = self.client.read_packet().await?;
        match packet.first().copied() {
            Some(0x00) => {
                let mut frame = Bytes::from(packet);
                frame.advance(1);
                Ok(Some(frame))
            }
            Some(0xFE) if packet.len() < 9 => Ok(None),
            Some(0xFF) => bail!("binlog stream error: {}", parse_server_error(&packet)),
            other => bail!("unexpected marker {other:?} in binlog stream"),
        }
    }
}

fn parse_handshake(payload: &[u8]) -> Result<Handshake> {
    let mut buf = Bytes::copy_from_slice(payload);
    if buf.is_empty() {
        bail!("empty handshake packet");
    }
    let protocol = buf.get_u8();
    if protocol != 10 {
        bail!("unsupported handshake protocol version {protocol}");
    }
    let server_version = take_nul_str(&mut buf)?;

    if buf.remaining() < 4 + 8 + 1 + 2 {
        bail!("truncated handshake packet");
    }
    let connection_id = buf.get_u32_le();
    let mut nonce = vec![0u8; 8];
    buf.copy_to_slice(&mut nonce);
    buf.advance(1); // filler
    let mut capabilities = buf.get_u16_le() as u32;

    let mut auth_plugin = String::new();
    if buf.remaining() >= 1 + 2 + 2 + 1 + 10 {
        let _charset = buf.get_u8();
        let _status = buf.get_u16_le();
        capabilities |= (buf.get_u16_le() as u32) << 16;
        let auth_data_len = buf.get_u8() as usize;
        buf.advance(10); // reserved

        // The declared length counts both parts plus the trailing nul, but
        // servers pad the second part to 13 bytes regardless.
        let extension_len = if auth_data_len > 8 { auth_data_len - 8 } else { 13 };
        if buf.remaining() < extension_len {
            bail!("truncated handshake scramble");
        }
        let mut extension = vec![0u8; extension_len];
        buf.copy_to_slice(&mut extension);
        if let Some(nul) = extension.iter().position(|&b| b == 0) {
            extension.truncate(nul);
        }
        nonce.extend_from_slice(&extension);

        if capabilities & CLIENT_PLUGIN_AUTH != 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            auth_plugin = String::from_utf8_lossy(&buf[..end]).into_owned();
        }
    }

    Ok(Handshake {
        server_version,
        connection_id,
        capabilities,
        auth_plugin,
        nonce,
    })
}

fn take_nul_str(buf: &mut Bytes) -> Result<String> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .context("unterminated string in handshake")?;
    let raw = buf.split_to(nul);
    buf.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Auth switch request: plugin name, nul, plugin-provided nonce.
fn parse_auth_switch(payload: &[u8]) -> Result<(String, Vec<u8>)> {
    let rest = &payload[1..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .context("malformed auth switch packet")?;
    let plugin = String::from_utf8_lossy(&rest[..nul]).into_owned();
    let mut nonce = rest[nul + 1..].to_vec();
    if nonce.last() == Some(&0) {
        nonce.pop();
    }
    Ok((plugin, nonce))
}

/// ERR packet: 0xFF, error code, optional `#` plus 5-byte SQL state, text.
fn parse_server_error(payload: &[u8]) -> String {
    if payload.len() < 3 {
        return "malformed error packet".to_string();
    }
    let code = u16::from_le_bytes([payload[1], payload[2]]);
    let mut rest = &payload[3..];
    if rest.first() == Some(&b'#') && rest.len() >= 6 {
        rest = &rest[6..];
    }
    format!("error {code}: {}", String::from_utf8_lossy(rest))
}

fn scramble_password(plugin: &str, password: &str, nonce: &[u8]) -> Result<Vec<u8>> {
    if password.is_empty() {
        return Ok(Vec::new());
    }
    match plugin {
        // Pre-plugin servers leave the name empty and expect native auth.
        "mysql_native_password" | "" => Ok(native_password_scramble(password, nonce)),
        "caching_sha2_password" => Ok(caching_sha2_scramble(password, nonce)),
        other => bail!("unsupported authentication plugin '{other}'"),
    }
}

/// `SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password)))`
fn native_password_scramble(password: &str, nonce: &[u8]) -> Vec<u8> {
    let nonce = &nonce[..nonce.len().min(20)];
    let hashed = Sha1::digest(password.as_bytes());
    let double_hashed = Sha1::digest(hashed);

    let mut salted = Sha1::new();
    salted.update(nonce);
    salted.update(double_hashed);
    let salted = salted.finalize();

    hashed
        .iter()
        .zip(salted.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) + nonce)`
fn caching_sha2_scramble(password: &str, nonce: &[u8]) -> Vec<u8> {
    let hashed = Sha256::digest(password.as_bytes());
    let double_hashed = Sha256::digest(hashed);

    let mut salted = Sha256::new();
    salted.update(double_hashed);
    salted.update(nonce);
    let salted = salted.finalize();

    hashed
        .iter()
        .zip(salted.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}
