//! Packet framing and message codec.
//!
//! MySQL frames every payload with a 3-byte little-endian length and a
//! 1-byte sequence number. The sequence resets to zero at each command
//! boundary and increments per packet in both directions; payloads of
//! exactly 2^24-1 bytes continue in the next packet.
//!
//! Unlike Postgres, server payloads are not self-describing: the same
//! leading byte means different things depending on where the
//! conversation stands. [`MySqlCodec`] therefore keeps a decode state
//! that mirrors the command lifecycle and hands each payload to the
//! right parser in [`crate::messages::backend`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::messages::backend::{
    self, EOF_HEADER, ERR_HEADER, OK_HEADER, ServerMessage, ServerVersion,
};
use crate::messages::frontend::ClientMessage;
use crate::wire;

/// Maximum payload of a single packet; longer payloads are split.
pub const MAX_PAYLOAD_SIZE: usize = 0xFF_FFFF;

const HEADER_SIZE: usize = 4;

/// An EOF packet is a 0xFE-headed payload shorter than 9 bytes; longer
/// 0xFE payloads are length-encoded integers or auth switch requests.
const EOF_MAX_LEN: usize = 9;

/// Marker for a LOCAL INFILE request, which this driver rejects.
const LOCAL_INFILE_HEADER: u8 = 0xFB;

/// Where the conversation stands, from the decoder's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Expecting the server greeting.
    Handshake,
    /// Handshake response sent; expecting OK, ERR or an auth switch.
    AuthResult,
    /// No command outstanding.
    Idle,
    /// COM_QUERY sent; expecting OK, ERR or a column count.
    QueryResponse,
    /// Consuming text result set column definitions.
    TextColumns { remaining: u64 },
    /// Consuming text result set rows.
    TextRows,
    /// COM_STMT_PREPARE sent; expecting prepare-OK or ERR.
    PrepareResponse,
    /// Consuming parameter definitions of a prepared statement.
    PrepareParams { remaining: u16, columns: u16 },
    /// Consuming column definitions of a prepared statement.
    PrepareColumns { remaining: u16 },
    /// COM_STMT_EXECUTE sent; expecting OK, ERR or a column count.
    ExecuteResponse,
    /// Consuming binary result set column definitions.
    BinaryColumns { remaining: u64 },
    /// Consuming binary result set rows.
    BinaryRows,
}

/// Codec translating between wire packets and protocol messages.
#[derive(Debug)]
pub struct MySqlCodec {
    sequence: u8,
    state: DecodeState,
    /// Reassembly buffer for payloads split across max-size packets.
    partial: BytesMut,
    version: Option<ServerVersion>,
}

impl MySqlCodec {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            state: DecodeState::Handshake,
            partial: BytesMut::new(),
            version: None,
        }
    }

    /// Server version seen in the handshake, once decoded.
    pub fn server_version(&self) -> Option<ServerVersion> {
        self.version
    }

    /// Drops any half-decoded result set state.
    ///
    /// Called on abnormal paths (query failure, teardown) so stale
    /// column or row expectations never bleed into the next command.
    pub fn clear_query_state(&mut self) {
        self.state = DecodeState::Idle;
        self.partial.clear();
    }

    fn take_packet(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }
            let payload_len =
                usize::from(src[0]) | (usize::from(src[1]) << 8) | (usize::from(src[2]) << 16);
            if src.len() < HEADER_SIZE + payload_len {
                src.reserve(HEADER_SIZE + payload_len - src.len());
                return Ok(None);
            }

            let sequence = src[3];
            if sequence != self.sequence {
                return Err(Error::Unexpected(format!(
                    "out-of-sequence packet: got {sequence}, expected {}",
                    self.sequence
                )));
            }
            self.sequence = sequence.wrapping_add(1);

            src.advance(HEADER_SIZE);
            let payload = src.split_to(payload_len).freeze();

            if payload_len == MAX_PAYLOAD_SIZE {
                self.partial.extend_from_slice(&payload);
                continue;
            }
            if !self.partial.is_empty() {
                self.partial.extend_from_slice(&payload);
                return Ok(Some(std::mem::take(&mut self.partial).freeze()));
            }
            return Ok(Some(payload));
        }
    }

    /// Dispatches one complete payload against the current state.
    ///
    /// Returns `None` for packets that are swallowed (column counts,
    /// spurious idle frames) rather than surfaced as messages.
    fn on_payload(&mut self, mut payload: Bytes) -> Result<Option<ServerMessage>> {
        let Some(&first) = payload.first() else {
            return Err(Error::Unexpected("empty packet".into()));
        };
        let len = payload.len();

        let message = match self.state {
            DecodeState::Handshake => {
                let handshake = backend::parse_handshake(&mut payload)?;
                self.version = Some(handshake.version);
                self.state = DecodeState::AuthResult;
                ServerMessage::Handshake(handshake)
            }
            DecodeState::AuthResult => match first {
                OK_HEADER => {
                    self.state = DecodeState::Idle;
                    ServerMessage::Ok(backend::parse_ok(&mut payload)?)
                }
                ERR_HEADER => {
                    self.state = DecodeState::Idle;
                    ServerMessage::Error(backend::parse_err(&mut payload)?)
                }
                EOF_HEADER => {
                    // Stay put: the switched plugin's result follows.
                    ServerMessage::AuthSwitchRequest(backend::parse_auth_switch(&mut payload)?)
                }
                other => {
                    return Err(Error::Unexpected(format!(
                        "unsupported authentication flow (marker 0x{other:02X})"
                    )));
                }
            },
            DecodeState::QueryResponse | DecodeState::ExecuteResponse => match first {
                OK_HEADER => {
                    self.state = DecodeState::Idle;
                    ServerMessage::Ok(backend::parse_ok(&mut payload)?)
                }
                ERR_HEADER => {
                    self.state = DecodeState::Idle;
                    ServerMessage::Error(backend::parse_err(&mut payload)?)
                }
                LOCAL_INFILE_HEADER => {
                    return Err(Error::Unexpected("LOCAL INFILE is not supported".into()));
                }
                _ => {
                    let columns = wire::get_lenenc_int(&mut payload)?;
                    if !payload.is_empty() {
                        return Err(Error::BufferNotFullyConsumed {
                            remaining: payload.len(),
                        });
                    }
                    self.state = if self.state == DecodeState::QueryResponse {
                        DecodeState::TextColumns { remaining: columns }
                    } else {
                        DecodeState::BinaryColumns { remaining: columns }
                    };
                    return Ok(None);
                }
            },
            DecodeState::TextColumns { remaining } | DecodeState::BinaryColumns { remaining }
                if remaining > 0 =>
            {
                let column = backend::parse_column_definition(&mut payload)?;
                self.state = match self.state {
                    DecodeState::TextColumns { .. } => DecodeState::TextColumns {
                        remaining: remaining - 1,
                    },
                    _ => DecodeState::BinaryColumns {
                        remaining: remaining - 1,
                    },
                };
                ServerMessage::ColumnDefinition(column)
            }
            DecodeState::TextColumns { .. } | DecodeState::BinaryColumns { .. } => {
                if first != EOF_HEADER || len >= EOF_MAX_LEN {
                    return Err(Error::Unexpected(format!(
                        "expected end of column definitions, got marker 0x{first:02X}"
                    )));
                }
                let eof = backend::parse_eof(&mut payload)?;
                self.state = match self.state {
                    DecodeState::TextColumns { .. } => DecodeState::TextRows,
                    _ => DecodeState::BinaryRows,
                };
                ServerMessage::Eof(eof)
            }
            DecodeState::TextRows => match first {
                EOF_HEADER if len < EOF_MAX_LEN => {
                    self.state = DecodeState::Idle;
                    ServerMessage::ResultSetComplete(backend::parse_eof(&mut payload)?)
                }
                ERR_HEADER => {
                    self.state = DecodeState::Idle;
                    ServerMessage::Error(backend::parse_err(&mut payload)?)
                }
                _ => ServerMessage::Row(backend::parse_text_row(&mut payload)?),
            },
            DecodeState::BinaryRows => match first {
                EOF_HEADER if len < EOF_MAX_LEN => {
                    self.state = DecodeState::Idle;
                    ServerMessage::ResultSetComplete(backend::parse_eof(&mut payload)?)
                }
                ERR_HEADER => {
                    self.state = DecodeState::Idle;
                    ServerMessage::Error(backend::parse_err(&mut payload)?)
                }
                OK_HEADER => {
                    // Raw row bytes; decoding needs the column metadata
                    // held by the accumulator.
                    return Ok(Some(ServerMessage::BinaryRow(payload)));
                }
                other => {
                    return Err(Error::Unexpected(format!(
                        "invalid binary row header 0x{other:02X}"
                    )));
                }
            },
            DecodeState::PrepareResponse => match first {
                OK_HEADER => {
                    let ok = backend::parse_stmt_prepare_ok(&mut payload)?;
                    self.state = if ok.num_params > 0 {
                        DecodeState::PrepareParams {
                            remaining: ok.num_params,
                            columns: ok.num_columns,
                        }
                    } else if ok.num_columns > 0 {
                        DecodeState::PrepareColumns {
                            remaining: ok.num_columns,
                        }
                    } else {
                        DecodeState::Idle
                    };
                    ServerMessage::PreparedStatementPrepared(ok)
                }
                ERR_HEADER => {
                    self.state = DecodeState::Idle;
                    ServerMessage::Error(backend::parse_err(&mut payload)?)
                }
                other => {
                    return Err(Error::Unexpected(format!(
                        "invalid prepare response marker 0x{other:02X}"
                    )));
                }
            },
            DecodeState::PrepareParams { remaining, columns } if remaining > 0 => {
                let column = backend::parse_column_definition(&mut payload)?;
                self.state = DecodeState::PrepareParams {
                    remaining: remaining - 1,
                    columns,
                };
                ServerMessage::ColumnDefinition(column)
            }
            DecodeState::PrepareParams { columns, .. } => {
                if first != EOF_HEADER || len >= EOF_MAX_LEN {
                    return Err(Error::Unexpected(format!(
                        "expected end of parameter definitions, got marker 0x{first:02X}"
                    )));
                }
                let eof = backend::parse_eof(&mut payload)?;
                self.state = if columns > 0 {
                    DecodeState::PrepareColumns { remaining: columns }
                } else {
                    DecodeState::Idle
                };
                ServerMessage::Eof(eof)
            }
            DecodeState::PrepareColumns { remaining } if remaining > 0 => {
                let column = backend::parse_column_definition(&mut payload)?;
                self.state = DecodeState::PrepareColumns {
                    remaining: remaining - 1,
                };
                ServerMessage::ColumnDefinition(column)
            }
            DecodeState::PrepareColumns { .. } => {
                if first != EOF_HEADER || len >= EOF_MAX_LEN {
                    return Err(Error::Unexpected(format!(
                        "expected end of prepare metadata, got marker 0x{first:02X}"
                    )));
                }
                let eof = backend::parse_eof(&mut payload)?;
                self.state = DecodeState::Idle;
                ServerMessage::Eof(eof)
            }
            DecodeState::Idle => match first {
                OK_HEADER => ServerMessage::Ok(backend::parse_ok(&mut payload)?),
                ERR_HEADER => ServerMessage::Error(backend::parse_err(&mut payload)?),
                EOF_HEADER if len < EOF_MAX_LEN => {
                    ServerMessage::Eof(backend::parse_eof(&mut payload)?)
                }
                other => {
                    // Servers occasionally emit stray frames between
                    // commands; dropping them beats tearing down an
                    // otherwise healthy connection.
                    tracing::warn!(marker = other, len, "dropping undecodable idle packet");
                    return Ok(None);
                }
            },
        };

        if !payload.is_empty() {
            return Err(Error::BufferNotFullyConsumed {
                remaining: payload.len(),
            });
        }
        Ok(Some(message))
    }
}

impl Default for MySqlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MySqlCodec {
    type Item = ServerMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerMessage>> {
        loop {
            let Some(payload) = self.take_packet(src)? else {
                return Ok(None);
            };
            if let Some(message) = self.on_payload(payload)? {
                return Ok(Some(message));
            }
        }
    }
}

impl Encoder<ClientMessage> for MySqlCodec {
    type Error = Error;

    fn encode(&mut self, message: ClientMessage, dst: &mut BytesMut) -> Result<()> {
        if message.starts_command() {
            self.sequence = 0;
            self.state = match &message {
                ClientMessage::Query { .. } | ClientMessage::Ping => DecodeState::QueryResponse,
                ClientMessage::PrepareStatement { .. } => DecodeState::PrepareResponse,
                ClientMessage::Execute { .. } => DecodeState::ExecuteResponse,
                // COM_QUIT and COM_STMT_CLOSE get no response.
                _ => DecodeState::Idle,
            };
        }

        let with_micros = self
            .version
            .map(|v| v.supports_microseconds())
            .unwrap_or(true);
        let mut payload = BytesMut::new();
        message.encode_payload(&mut payload, with_micros);

        loop {
            let chunk_len = payload.len().min(MAX_PAYLOAD_SIZE);
            let chunk = payload.split_to(chunk_len);
            wire::put_u24_le(dst, chunk_len as u32);
            dst.put_u8(self.sequence);
            dst.put_slice(&chunk);
            self.sequence = self.sequence.wrapping_add(1);

            // An exact-max chunk needs a follow-up packet, possibly
            // empty, to mark the end of the payload.
            if payload.is_empty() && chunk_len < MAX_PAYLOAD_SIZE {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    fn packet(sequence: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 4);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        out.push(sequence);
        out.extend_from_slice(payload);
        out
    }

    fn handshake_payload() -> Vec<u8> {
        use crate::messages::frontend::capabilities::*;
        let caps = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        let mut payload = vec![10];
        payload.extend_from_slice(b"5.7.26-log\0");
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(&[1; 8]);
        payload.push(0);
        payload.extend_from_slice(&((caps & 0xFFFF) as u16).to_le_bytes());
        payload.push(8);
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        payload.push(21);
        payload.extend_from_slice(&[0; 10]);
        payload.extend_from_slice(&[2; 12]);
        payload.push(0);
        payload.extend_from_slice(b"mysql_native_password\0");
        payload
    }

    fn column_payload(name: &str, column_type: FieldType) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for field in ["def", "", "", "", name, ""] {
            crate::wire::put_lenenc_bytes(&mut buf, field.as_bytes());
        }
        buf.put_u8(0x0C);
        buf.put_u16_le(63);
        buf.put_u32_le(11);
        buf.put_u8(column_type as u8);
        buf.put_u16_le(0);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf.to_vec()
    }

    fn decode_one(codec: &mut MySqlCodec, src: &mut BytesMut) -> ServerMessage {
        codec.decode(src).unwrap().expect("a decoded message")
    }

    #[test]
    fn test_decode_handshake_then_ok() {
        let mut codec = MySqlCodec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&packet(0, &handshake_payload()));

        let message = decode_one(&mut codec, &mut src);
        let ServerMessage::Handshake(handshake) = message else {
            panic!("expected handshake, got {}", message.name());
        };
        assert_eq!(handshake.version, ServerVersion::new(5, 7, 26));
        assert_eq!(handshake.seed.len(), 20);
        assert_eq!(codec.server_version(), Some(ServerVersion::new(5, 7, 26)));

        // The handshake response occupies sequence 1.
        codec.sequence = codec.sequence.wrapping_add(1);

        src.extend_from_slice(&packet(2, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]));
        let message = decode_one(&mut codec, &mut src);
        assert!(matches!(message, ServerMessage::Ok(_)));
    }

    #[test]
    fn test_decode_out_of_sequence_is_fatal() {
        let mut codec = MySqlCodec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&packet(3, &handshake_payload()));
        let err = codec.decode(&mut src).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decode_needs_full_packet() {
        let mut codec = MySqlCodec::new();
        let mut src = BytesMut::new();
        let bytes = packet(0, &handshake_payload());
        src.extend_from_slice(&bytes[..10]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&bytes[10..]);
        assert!(codec.decode(&mut src).unwrap().is_some());
    }

    #[test]
    fn test_text_result_set_sequence() {
        let mut codec = MySqlCodec::new();
        codec.state = DecodeState::Idle;
        let mut dst = BytesMut::new();
        codec
            .encode(
                ClientMessage::Query {
                    sql: "SELECT 1".into(),
                },
                &mut dst,
            )
            .unwrap();
        assert_eq!(&dst[..5], &[9, 0, 0, 0, 0x03]);

        let mut src = BytesMut::new();
        src.extend_from_slice(&packet(1, &[0x01])); // column count
        src.extend_from_slice(&packet(2, &column_payload("1", FieldType::LongLong)));
        src.extend_from_slice(&packet(3, &[0xFE, 0x00, 0x00, 0x02, 0x00]));
        src.extend_from_slice(&packet(4, &[0x01, b'1']));
        src.extend_from_slice(&packet(5, &[0xFE, 0x00, 0x00, 0x02, 0x00]));

        let message = decode_one(&mut codec, &mut src);
        assert!(matches!(message, ServerMessage::ColumnDefinition(_)));
        let message = decode_one(&mut codec, &mut src);
        assert!(matches!(message, ServerMessage::Eof(_)));
        let message = decode_one(&mut codec, &mut src);
        let ServerMessage::Row(values) = message else {
            panic!("expected row, got {}", message.name());
        };
        assert_eq!(values[0].as_deref(), Some(&b"1"[..]));
        let message = decode_one(&mut codec, &mut src);
        assert!(matches!(message, ServerMessage::ResultSetComplete(_)));
        assert_eq!(codec.state, DecodeState::Idle);
    }

    #[test]
    fn test_query_error_returns_to_idle() {
        let mut codec = MySqlCodec::new();
        codec.state = DecodeState::Idle;
        let mut dst = BytesMut::new();
        codec
            .encode(
                ClientMessage::Query {
                    sql: "SYNTAX ERROR".into(),
                },
                &mut dst,
            )
            .unwrap();

        let mut err_payload = vec![0xFF, 0x28, 0x04, b'#'];
        err_payload.extend_from_slice(b"42000");
        err_payload.extend_from_slice(b"You have an error");
        let mut src = BytesMut::new();
        src.extend_from_slice(&packet(1, &err_payload));

        let message = decode_one(&mut codec, &mut src);
        let ServerMessage::Error(err) = message else {
            panic!("expected error, got {}", message.name());
        };
        assert_eq!(err.code, 1064);
        assert_eq!(codec.state, DecodeState::Idle);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut codec = MySqlCodec::new();
        codec.state = DecodeState::TextColumns { remaining: 0 };
        // EOF with an extra byte tacked on.
        let mut src = BytesMut::new();
        src.extend_from_slice(&packet(0, &[0xFE, 0x00, 0x00, 0x02, 0x00, 0xAB]));
        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(err, Error::BufferNotFullyConsumed { remaining: 1 }));
    }

    #[test]
    fn test_idle_spurious_packet_is_swallowed() {
        let mut codec = MySqlCodec::new();
        codec.state = DecodeState::Idle;
        let mut src = BytesMut::new();
        src.extend_from_slice(&packet(0, &[0x42, 0x42]));
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());
    }

    #[test]
    fn test_prepare_flow_states() {
        let mut codec = MySqlCodec::new();
        codec.state = DecodeState::Idle;
        let mut dst = BytesMut::new();
        codec
            .encode(
                ClientMessage::PrepareStatement {
                    sql: "SELECT ?".into(),
                },
                &mut dst,
            )
            .unwrap();

        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&1u32.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes()); // columns
        prepare_ok.extend_from_slice(&1u16.to_le_bytes()); // params
        prepare_ok.push(0);
        prepare_ok.extend_from_slice(&0u16.to_le_bytes());

        let mut src = BytesMut::new();
        src.extend_from_slice(&packet(1, &prepare_ok));
        src.extend_from_slice(&packet(2, &column_payload("?", FieldType::VarString)));
        src.extend_from_slice(&packet(3, &[0xFE, 0x00, 0x00, 0x02, 0x00]));
        src.extend_from_slice(&packet(4, &column_payload("c", FieldType::LongLong)));
        src.extend_from_slice(&packet(5, &[0xFE, 0x00, 0x00, 0x02, 0x00]));

        assert!(matches!(
            decode_one(&mut codec, &mut src),
            ServerMessage::PreparedStatementPrepared(_)
        ));
        assert!(matches!(
            decode_one(&mut codec, &mut src),
            ServerMessage::ColumnDefinition(_)
        ));
        assert!(matches!(decode_one(&mut codec, &mut src), ServerMessage::Eof(_)));
        assert!(matches!(
            decode_one(&mut codec, &mut src),
            ServerMessage::ColumnDefinition(_)
        ));
        assert!(matches!(decode_one(&mut codec, &mut src), ServerMessage::Eof(_)));
        assert_eq!(codec.state, DecodeState::Idle);
    }

    #[test]
    fn test_binary_row_passthrough() {
        let mut codec = MySqlCodec::new();
        codec.state = DecodeState::BinaryRows;
        codec.sequence = 0;
        let mut src = BytesMut::new();
        src.extend_from_slice(&packet(0, &[0x00, 0x00, 42, 0, 0, 0, 0, 0, 0, 0]));

        let message = decode_one(&mut codec, &mut src);
        let ServerMessage::BinaryRow(payload) = message else {
            panic!("expected binary row, got {}", message.name());
        };
        assert_eq!(payload.len(), 10);
    }

    #[test]
    fn test_clear_query_state() {
        let mut codec = MySqlCodec::new();
        codec.state = DecodeState::TextRows;
        codec.partial.extend_from_slice(&[1, 2, 3]);
        codec.clear_query_state();
        assert_eq!(codec.state, DecodeState::Idle);
        assert!(codec.partial.is_empty());
    }

    #[test]
    fn test_encode_resets_sequence_per_command() {
        let mut codec = MySqlCodec::new();
        codec.state = DecodeState::Idle;
        codec.sequence = 7;
        let mut dst = BytesMut::new();
        codec.encode(ClientMessage::Ping, &mut dst).unwrap();
        assert_eq!(dst[3], 0); // sequence reset
        assert_eq!(codec.sequence, 1);
    }
}
