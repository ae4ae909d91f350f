//! Logic for handling and representing client-to-server messages.
//!
//! Client payloads start with a command byte (except during the
//! handshake, where position in the conversation identifies them). The
//! codec frames these payloads and owns the sequence counter.
//!
//! See: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_command_phase.html>

use bytes::{BufMut, BytesMut};

use crate::types::{self, FieldType, Value};
use crate::wire;

/// Client/server capability flags.
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Flags this driver always offers. `CLIENT_DEPRECATE_EOF` is left
    /// out on purpose: result sets terminate on EOF packets.
    pub const BASE_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
}

/// Command bytes for the command phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Close the connection
    Quit = 0x01,
    /// Text protocol query
    Query = 0x03,
    /// Liveness check
    Ping = 0x0E,
    /// Prepare a statement
    StmtPrepare = 0x16,
    /// Execute a prepared statement
    StmtExecute = 0x17,
    /// Close a prepared statement (no server response)
    StmtClose = 0x19,
}

/// A client message ready for encoding.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Reply to the server handshake.
    HandshakeResponse {
        capabilities: u32,
        max_packet_size: u32,
        charset_id: u8,
        user: String,
        auth_response: Vec<u8>,
        database: Option<String>,
        auth_plugin: String,
        attributes: Vec<(String, String)>,
    },
    /// Credential material for the plugin named in an auth switch request.
    AuthSwitchResponse { auth_response: Vec<u8> },
    /// COM_QUERY
    Query { sql: String },
    /// COM_QUIT
    Quit,
    /// COM_PING
    Ping,
    /// COM_STMT_PREPARE
    PrepareStatement { sql: String },
    /// COM_STMT_EXECUTE with binary-encoded parameters.
    Execute {
        statement_id: u32,
        params: Vec<Value>,
        types: Vec<FieldType>,
    },
    /// COM_STMT_CLOSE
    CloseStatement { statement_id: u32 },
}

impl ClientMessage {
    /// Whether this message begins a new command, resetting the packet
    /// sequence counter. Handshake-phase replies continue the server's
    /// sequence instead.
    pub fn starts_command(&self) -> bool {
        !matches!(
            self,
            ClientMessage::HandshakeResponse { .. } | ClientMessage::AuthSwitchResponse { .. }
        )
    }

    /// Encodes the message payload, without packet framing.
    ///
    /// `with_micros` gates fractional seconds on temporal parameters
    /// (supported by servers 5.6.0 and later).
    pub fn encode_payload(&self, buf: &mut BytesMut, with_micros: bool) {
        match self {
            ClientMessage::HandshakeResponse {
                capabilities,
                max_packet_size,
                charset_id,
                user,
                auth_response,
                database,
                auth_plugin,
                attributes,
            } => {
                buf.put_u32_le(*capabilities);
                buf.put_u32_le(*max_packet_size);
                buf.put_u8(*charset_id);
                buf.put_bytes(0, 23); // reserved
                wire::put_cstring(buf, user);

                if capabilities & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
                    wire::put_lenenc_bytes(buf, auth_response);
                } else {
                    buf.put_u8(auth_response.len() as u8);
                    buf.put_slice(auth_response);
                }

                if capabilities & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
                    wire::put_cstring(buf, database.as_deref().unwrap_or(""));
                }

                if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
                    wire::put_cstring(buf, auth_plugin);
                }

                if capabilities & capabilities::CLIENT_CONNECT_ATTRS != 0 {
                    let mut attrs = BytesMut::new();
                    for (key, value) in attributes {
                        wire::put_lenenc_bytes(&mut attrs, key.as_bytes());
                        wire::put_lenenc_bytes(&mut attrs, value.as_bytes());
                    }
                    wire::put_lenenc_bytes(buf, &attrs);
                }
            }
            ClientMessage::AuthSwitchResponse { auth_response } => {
                buf.put_slice(auth_response);
            }
            ClientMessage::Query { sql } => {
                buf.put_u8(Command::Query as u8);
                buf.put_slice(sql.as_bytes());
            }
            ClientMessage::Quit => {
                buf.put_u8(Command::Quit as u8);
            }
            ClientMessage::Ping => {
                buf.put_u8(Command::Ping as u8);
            }
            ClientMessage::PrepareStatement { sql } => {
                buf.put_u8(Command::StmtPrepare as u8);
                buf.put_slice(sql.as_bytes());
            }
            ClientMessage::Execute {
                statement_id,
                params,
                types,
            } => {
                buf.put_u8(Command::StmtExecute as u8);
                buf.put_u32_le(*statement_id);
                buf.put_u8(0x00); // CURSOR_TYPE_NO_CURSOR
                buf.put_u32_le(1); // iteration count

                if !params.is_empty() {
                    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
                    for (i, param) in params.iter().enumerate() {
                        if matches!(param, Value::Null) {
                            null_bitmap[i / 8] |= 1 << (i % 8);
                        }
                    }
                    buf.put_slice(&null_bitmap);

                    buf.put_u8(1); // new params bound
                    for field_type in types {
                        buf.put_u8(*field_type as u8);
                        buf.put_u8(0x00); // signed
                    }
                    for param in params {
                        types::put_binary_value(buf, param, with_micros);
                    }
                }
            }
            ClientMessage::CloseStatement { statement_id } => {
                buf.put_u8(Command::StmtClose as u8);
                buf.put_u32_le(*statement_id);
            }
        }
    }
}

/// Counts `?` placeholders in a statement.
///
/// This is a literal byte count: question marks inside string literals
/// and comments are counted too. Known limitation, kept for parity with
/// how the server-side count is matched in practice.
pub fn placeholder_count(sql: &str) -> usize {
    sql.bytes().filter(|&b| b == b'?').count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_count() {
        assert_eq!(placeholder_count("SELECT 1"), 0);
        assert_eq!(placeholder_count("SELECT ?, ?"), 2);
        // Literal count: the quoted question mark is included.
        assert_eq!(placeholder_count("SELECT '?', ?"), 2);
    }

    #[test]
    fn test_query_payload() {
        let mut buf = BytesMut::new();
        ClientMessage::Query {
            sql: "SELECT 1".into(),
        }
        .encode_payload(&mut buf, true);
        assert_eq!(buf[0], Command::Query as u8);
        assert_eq!(&buf[1..], b"SELECT 1");
    }

    #[test]
    fn test_quit_payload() {
        let mut buf = BytesMut::new();
        ClientMessage::Quit.encode_payload(&mut buf, true);
        assert_eq!(&buf[..], &[Command::Quit as u8]);
    }

    #[test]
    fn test_starts_command() {
        assert!(ClientMessage::Query { sql: String::new() }.starts_command());
        assert!(ClientMessage::Quit.starts_command());
        assert!(
            !ClientMessage::AuthSwitchResponse {
                auth_response: vec![],
            }
            .starts_command()
        );
    }

    #[test]
    fn test_handshake_response_payload() {
        let caps = capabilities::BASE_CLIENT_FLAGS | capabilities::CLIENT_CONNECT_WITH_DB;
        let mut buf = BytesMut::new();
        ClientMessage::HandshakeResponse {
            capabilities: caps,
            max_packet_size: 0x0100_0000,
            charset_id: 45,
            user: "root".into(),
            auth_response: vec![0xAA; 20],
            database: Some("test".into()),
            auth_plugin: "mysql_native_password".into(),
            attributes: vec![],
        }
        .encode_payload(&mut buf, true);

        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), caps);
        assert_eq!(buf[8], 45);
        // 23 reserved bytes, then the nul-terminated user.
        assert_eq!(&buf[9..32], &[0u8; 23]);
        assert_eq!(&buf[32..37], b"root\0");
        // Length-encoded auth response.
        assert_eq!(buf[37], 20);
        assert_eq!(&buf[38..58], &[0xAA; 20]);
        assert_eq!(&buf[58..63], b"test\0");
        assert_eq!(&buf[63..], b"mysql_native_password\0");
    }

    #[test]
    fn test_execute_payload_null_bitmap_and_types() {
        let params = vec![Value::Null, Value::Int(42)];
        let types = params.iter().map(types::field_type_for).collect();
        let mut buf = BytesMut::new();
        ClientMessage::Execute {
            statement_id: 7,
            params,
            types,
        }
        .encode_payload(&mut buf, true);

        assert_eq!(buf[0], Command::StmtExecute as u8);
        assert_eq!(u32::from_le_bytes(buf[1..5].try_into().unwrap()), 7);
        assert_eq!(buf[5], 0x00);
        assert_eq!(u32::from_le_bytes(buf[6..10].try_into().unwrap()), 1);
        assert_eq!(buf[10], 0b0000_0001); // first param is NULL
        assert_eq!(buf[11], 1); // new params bound
        assert_eq!(buf[12], FieldType::Null as u8);
        assert_eq!(buf[14], FieldType::Long as u8);
        // Only the non-NULL value is written.
        assert_eq!(&buf[16..], &42u32.to_le_bytes());
    }
}
