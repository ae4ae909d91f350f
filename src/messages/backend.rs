//! Logic for handling and representing server-to-client messages.
//!
//! MySQL server packets are not self-describing the way Postgres frames
//! are; the first payload byte disambiguates OK/ERR/EOF packets, and
//! everything else depends on where the conversation stands. The codec
//! tracks that position and calls the parsers here once it knows what a
//! payload must be.
//!
//! See: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_response_packets.html>

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};
use crate::types::{ColumnDefinition, FieldType};
use crate::wire;

/// Server status flags carried by OK and EOF packets.
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// First payload byte of an OK packet.
pub const OK_HEADER: u8 = 0x00;
/// First payload byte of an ERR packet.
pub const ERR_HEADER: u8 = 0xFF;
/// First payload byte of an EOF packet (payload shorter than 9 bytes).
pub const EOF_HEADER: u8 = 0xFE;

/// A decoded server message, in the order the protocol can produce them.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Initial greeting carrying version, seed and capabilities.
    Handshake(Handshake),
    /// Command or authentication success.
    Ok(OkPacket),
    /// Terminator of a column-definition block.
    Eof(EofPacket),
    /// Server-reported error.
    Error(ErrPacket),
    /// Server asks to redo authentication with another plugin.
    AuthSwitchRequest(AuthSwitchRequest),
    /// One column of result set metadata.
    ColumnDefinition(ColumnDefinition),
    /// One text-protocol row; `None` entries are SQL NULL.
    Row(Vec<Option<Bytes>>),
    /// One binary-protocol row, undecoded; interpretation needs the
    /// column metadata collected earlier in the result set.
    BinaryRow(Bytes),
    /// Terminator of the row stream; the result set is complete.
    ResultSetComplete(EofPacket),
    /// Response to a prepare command.
    PreparedStatementPrepared(StmtPrepareOk),
}

impl ServerMessage {
    /// Short message name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Handshake(_) => "Handshake",
            ServerMessage::Ok(_) => "Ok",
            ServerMessage::Eof(_) => "Eof",
            ServerMessage::Error(_) => "Error",
            ServerMessage::AuthSwitchRequest(_) => "AuthSwitchRequest",
            ServerMessage::ColumnDefinition(_) => "ColumnDefinition",
            ServerMessage::Row(_) => "Row",
            ServerMessage::BinaryRow(_) => "BinaryRow",
            ServerMessage::ResultSetComplete(_) => "ResultSetComplete",
            ServerMessage::PreparedStatementPrepared(_) => "PreparedStatementPrepared",
        }
    }
}

/// Server version triple parsed from the handshake's version string.
///
/// Suffixes like `-log` or `-MariaDB` are ignored; missing components
/// default to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ServerVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn parse(raw: &str) -> Self {
        let numeric = raw.split(['-', '+']).next().unwrap_or(raw);
        let mut parts = numeric.split('.').map(|p| p.parse::<u16>().unwrap_or(0));
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }

    /// Fractional seconds in temporal values arrived in 5.6.0.
    pub fn supports_microseconds(&self) -> bool {
        *self >= ServerVersion::new(5, 6, 0)
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Initial handshake packet (protocol version 10).
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Raw server version string, e.g. `5.7.26-log`
    pub server_version: String,
    /// Parsed version triple
    pub version: ServerVersion,
    /// Server-assigned connection (thread) id
    pub connection_id: u32,
    /// Random seed for the password scramble
    pub seed: Vec<u8>,
    /// Server capability flags
    pub capabilities: u32,
    /// Default server charset
    pub charset: u8,
    /// Server status flags
    pub status_flags: u16,
    /// Authentication plugin the server wants first
    pub auth_plugin: String,
}

/// Parsed OK packet.
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// Parsed ERR packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn into_error(self) -> Error {
        Error::Protocol {
            code: self.code,
            sql_state: self.sql_state,
            message: self.message,
        }
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

/// Auth switch request: redo authentication with `plugin` and a fresh seed.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub seed: Vec<u8>,
}

/// Response to COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy)]
pub struct StmtPrepareOk {
    /// Server-assigned statement id, used in execute and close
    pub statement_id: u32,
    /// Number of result columns (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of `?` placeholders the server parsed
    pub num_params: u16,
    pub warnings: u16,
}

/// Parses the initial handshake payload.
pub fn parse_handshake(buf: &mut Bytes) -> Result<Handshake> {
    let protocol_version = wire::get_u8(buf)?;
    if protocol_version != 10 {
        return Err(Error::Unexpected(format!(
            "unsupported handshake protocol version {protocol_version}"
        )));
    }

    let server_version = wire::get_cstring(buf)?;
    let connection_id = wire::get_u32_le(buf)?;

    wire::need(buf, 9)?;
    let mut seed = buf.split_to(8).to_vec();
    buf.advance(1); // filler

    let caps_lower = wire::get_u16_le(buf)?;

    // Everything past the lower capability bytes is optional in very old
    // servers; parse leniently.
    let charset = if buf.has_remaining() { buf.get_u8() } else { 0 };
    let status_flags = if buf.remaining() >= 2 { buf.get_u16_le() } else { 0 };
    let caps_upper = if buf.remaining() >= 2 { buf.get_u16_le() } else { 0 };
    let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

    let auth_data_len = if buf.has_remaining() { buf.get_u8() as usize } else { 0 };
    if buf.remaining() >= 10 {
        buf.advance(10); // reserved
    }

    if capabilities & crate::messages::frontend::capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len = if auth_data_len > 8 { auth_data_len - 8 } else { 13 };
        let part2 = buf.split_to(len.min(buf.remaining()));
        // Strip the trailing NUL the server appends to the seed.
        let part2 = match part2.last() {
            Some(0) => &part2[..part2.len() - 1],
            _ => &part2[..],
        };
        seed.extend_from_slice(part2);
    }

    let auth_plugin = if capabilities & crate::messages::frontend::capabilities::CLIENT_PLUGIN_AUTH
        != 0
        && buf.has_remaining()
    {
        wire::get_cstring(buf)?
    } else {
        crate::auth::MYSQL_NATIVE_PASSWORD.to_string()
    };

    let version = ServerVersion::parse(&server_version);
    Ok(Handshake {
        server_version,
        version,
        connection_id,
        seed,
        capabilities,
        charset,
        status_flags,
        auth_plugin,
    })
}

/// Parses an OK payload; the leading `0x00` marker is still present.
pub fn parse_ok(buf: &mut Bytes) -> Result<OkPacket> {
    buf.advance(1); // 0x00 marker
    let affected_rows = wire::get_lenenc_int(buf)?;
    let last_insert_id = wire::get_lenenc_int(buf)?;
    let status_flags = wire::get_u16_le(buf)?;
    let warnings = wire::get_u16_le(buf)?;
    let info = String::from_utf8_lossy(&buf.split_to(buf.remaining())).into_owned();
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
        info,
    })
}

/// Parses an ERR payload; the leading `0xFF` marker is still present.
///
/// The `#`-prefixed SQL state block is absent in pre-auth errors sent
/// by old servers, in which case the state comes back empty.
pub fn parse_err(buf: &mut Bytes) -> Result<ErrPacket> {
    buf.advance(1); // 0xFF marker
    let code = wire::get_u16_le(buf)?;
    let sql_state = if buf.first() == Some(&b'#') {
        buf.advance(1);
        wire::need(buf, 5)?;
        String::from_utf8_lossy(&buf.split_to(5)).into_owned()
    } else {
        String::new()
    };
    let message = String::from_utf8_lossy(&buf.split_to(buf.remaining())).into_owned();
    Ok(ErrPacket {
        code,
        sql_state,
        message,
    })
}

/// Parses an EOF payload; the leading `0xFE` marker is still present.
pub fn parse_eof(buf: &mut Bytes) -> Result<EofPacket> {
    buf.advance(1); // 0xFE marker
    let warnings = wire::get_u16_le(buf)?;
    let status_flags = wire::get_u16_le(buf)?;
    Ok(EofPacket {
        warnings,
        status_flags,
    })
}

/// Parses an auth switch request; the leading `0xFE` marker is still present.
pub fn parse_auth_switch(buf: &mut Bytes) -> Result<AuthSwitchRequest> {
    buf.advance(1); // 0xFE marker
    let plugin = wire::get_cstring(buf)?;
    let mut seed = buf.split_to(buf.remaining()).to_vec();
    if seed.last() == Some(&0) {
        seed.pop();
    }
    Ok(AuthSwitchRequest { plugin, seed })
}

/// Parses a COM_STMT_PREPARE_OK payload; the leading `0x00` marker is
/// still present.
pub fn parse_stmt_prepare_ok(buf: &mut Bytes) -> Result<StmtPrepareOk> {
    buf.advance(1); // 0x00 marker
    let statement_id = wire::get_u32_le(buf)?;
    let num_columns = wire::get_u16_le(buf)?;
    let num_params = wire::get_u16_le(buf)?;
    if buf.has_remaining() {
        buf.advance(1); // reserved filler
    }
    let warnings = if buf.remaining() >= 2 { buf.get_u16_le() } else { 0 };
    Ok(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

/// Parses a column definition payload (protocol 4.1 layout).
pub fn parse_column_definition(buf: &mut Bytes) -> Result<ColumnDefinition> {
    let catalog = wire::get_lenenc_string(buf)?;
    let schema = wire::get_lenenc_string(buf)?;
    let table = wire::get_lenenc_string(buf)?;
    let org_table = wire::get_lenenc_string(buf)?;
    let name = wire::get_lenenc_string(buf)?;
    let org_name = wire::get_lenenc_string(buf)?;

    let fixed_len = wire::get_lenenc_int(buf)?;
    if fixed_len != 0x0C {
        return Err(Error::Unexpected(format!(
            "column definition fixed-length block is {fixed_len}, expected 12"
        )));
    }
    let charset = wire::get_u16_le(buf)?;
    let column_length = wire::get_u32_le(buf)?;
    let column_type = FieldType::from_u8(wire::get_u8(buf)?)?;
    let flags = wire::get_u16_le(buf)?;
    let decimals = wire::get_u8(buf)?;
    wire::need(buf, 2)?;
    buf.advance(2); // filler

    Ok(ColumnDefinition {
        catalog,
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        column_length,
        column_type,
        flags,
        decimals,
    })
}

/// Parses a text-protocol row into its raw column values.
pub fn parse_text_row(buf: &mut Bytes) -> Result<Vec<Option<Bytes>>> {
    let mut values = Vec::new();
    while buf.has_remaining() {
        values.push(wire::get_lenenc_value(buf)?);
    }
    Ok(values)
}
