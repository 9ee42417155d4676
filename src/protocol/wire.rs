//! PostgreSQL Wire Protocol Messages
//!
//! Implementation of the PostgreSQL Frontend/Backend Protocol (v3).
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{BufMut, BytesMut};

use super::EncodeError;

/// Protocol version 3.0
const PROTOCOL_VERSION: i32 = 196608;

/// CancelRequest protocol code: 80877102
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Frontend (client → server) message types
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// Startup message (sent first, no type byte)
    Startup { params: Vec<(String, String)> },
    /// Password response (cleartext or md5-hashed)
    PasswordMessage(String),
    Query(String),
    /// Parse (unnamed statement, types inferred by the server)
    Parse { name: String, query: String },
    /// Bind text-format parameters to a statement
    Bind {
        portal: String,
        statement: String,
        params: Vec<Option<Vec<u8>>>,
    },
    /// Describe a portal, so a RowDescription precedes the rows
    DescribePortal(String),
    /// Execute portal
    Execute { portal: String, max_rows: i32 },
    Sync,
    Terminate,
    /// Abort a COPY FROM STDIN the driver cannot feed
    CopyFail(String),
    /// SASL initial response (first message in SCRAM)
    SASLInitialResponse { mechanism: String, data: Vec<u8> },
    /// SASL response (subsequent messages in SCRAM)
    SASLResponse(Vec<u8>),
}

/// Backend (server → client) message types
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password([u8; 4]),
    AuthenticationSASL(Vec<String>),
    AuthenticationSASLContinue(Vec<u8>),
    AuthenticationSASLFinal(Vec<u8>),
    /// Parameter status (server config)
    ParameterStatus {
        name: String,
        value: String,
    },
    /// Backend key data (for cancel)
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    ErrorResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    NoData,
    PortalSuspended,
    CopyInResponse,
    CopyOutResponse,
    CopyData(Vec<u8>),
    CopyDone,
    /// Notification response (async notification from LISTEN/NOTIFY)
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    EmptyQueryResponse,
    /// Notice response (warning/info messages, not errors)
    NoticeResponse(ErrorFields),
}

/// Transaction status reported by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,    // 'I'
    InBlock, // 'T'
    Failed,  // 'E'
}

/// Field description in RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Error fields from ErrorResponse / NoticeResponse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
}

impl ErrorFields {
    /// Render the fields the way psql prints a diagnostic.
    pub fn diagnostic(&self) -> String {
        let mut out = format!("{}:  {}\n", self.severity, self.message);
        if let Some(detail) = &self.detail {
            out.push_str(&format!("DETAIL:  {}\n", detail));
        }
        if let Some(hint) = &self.hint {
            out.push_str(&format!("HINT:  {}\n", hint));
        }
        if let Some(position) = &self.position {
            out.push_str(&format!("POSITION:  {}\n", position));
        }
        out
    }
}

/// Write a length-prefixed message body produced by `body`.
fn put_message(
    buf: &mut BytesMut,
    tag: Option<u8>,
    body: impl FnOnce(&mut BytesMut) -> Result<(), EncodeError>,
) -> Result<(), EncodeError> {
    let start = buf.len();
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let len_pos = buf.len();
    buf.put_i32(0);
    if let Err(e) = body(buf) {
        buf.truncate(start);
        return Err(e);
    }
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_cstr(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    if s.as_bytes().contains(&0) {
        return Err(EncodeError::NullByte);
    }
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

impl FrontendMessage {
    /// Encode message onto the end of `buf`. On error `buf` is left as it was.
    pub fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            FrontendMessage::Startup { params } => put_message(buf, None, |b| {
                b.put_i32(PROTOCOL_VERSION);
                for (name, value) in params {
                    put_cstr(b, name)?;
                    put_cstr(b, value)?;
                }
                b.put_u8(0); // Terminator
                Ok(())
            }),
            FrontendMessage::PasswordMessage(password) => {
                put_message(buf, Some(b'p'), |b| put_cstr(b, password))
            }
            FrontendMessage::Query(sql) => put_message(buf, Some(b'Q'), |b| put_cstr(b, sql)),
            FrontendMessage::Parse { name, query } => put_message(buf, Some(b'P'), |b| {
                put_cstr(b, name)?;
                put_cstr(b, query)?;
                b.put_i16(0); // No param types (infer)
                Ok(())
            }),
            FrontendMessage::Bind {
                portal,
                statement,
                params,
            } => {
                if params.len() > i16::MAX as usize {
                    return Err(EncodeError::TooManyParameters(params.len()));
                }
                put_message(buf, Some(b'B'), |b| {
                    put_cstr(b, portal)?;
                    put_cstr(b, statement)?;
                    b.put_i16(0); // Format codes (default text)
                    b.put_i16(params.len() as i16);
                    for param in params {
                        match param {
                            None => b.put_i32(-1),
                            Some(data) => {
                                b.put_i32(data.len() as i32);
                                b.extend_from_slice(data);
                            }
                        }
                    }
                    b.put_i16(0); // Result format (default text)
                    Ok(())
                })
            }
            FrontendMessage::DescribePortal(portal) => put_message(buf, Some(b'D'), |b| {
                b.put_u8(b'P');
                put_cstr(b, portal)
            }),
            FrontendMessage::Execute { portal, max_rows } => {
                put_message(buf, Some(b'E'), |b| {
                    put_cstr(b, portal)?;
                    b.put_i32(*max_rows);
                    Ok(())
                })
            }
            FrontendMessage::Sync => put_message(buf, Some(b'S'), |_| Ok(())),
            FrontendMessage::Terminate => put_message(buf, Some(b'X'), |_| Ok(())),
            FrontendMessage::CopyFail(reason) => {
                put_message(buf, Some(b'f'), |b| put_cstr(b, reason))
            }
            FrontendMessage::SASLInitialResponse { mechanism, data } => {
                put_message(buf, Some(b'p'), |b| {
                    put_cstr(b, mechanism)?;
                    b.put_i32(data.len() as i32);
                    b.extend_from_slice(data);
                    Ok(())
                })
            }
            FrontendMessage::SASLResponse(data) => put_message(buf, Some(b'p'), |b| {
                b.extend_from_slice(data);
                Ok(())
            }),
        }
    }

    /// Encode message to a fresh buffer.
    pub fn encode(&self) -> Result<BytesMut, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf)?;
        Ok(buf)
    }
}

/// Encode the 16-byte CancelRequest packet sent on a fresh socket.
pub fn encode_cancel_request(process_id: i32, secret_key: i32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..4].copy_from_slice(&16i32.to_be_bytes()); // Length
    buf[4..8].copy_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
    buf[8..12].copy_from_slice(&process_id.to_be_bytes());
    buf[12..16].copy_from_slice(&secret_key.to_be_bytes());
    buf
}

/// Bounds-checked reader over a message payload.
struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or("message truncated")?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, String> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, String> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self) -> Result<String, String> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or("missing null terminator")?;
        let s = String::from_utf8_lossy(&rest[..end]).to_string();
        self.pos += end + 1;
        Ok(s)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Total length of the first complete frame in `buf` (type byte included),
/// or `None` while the frame is still incomplete.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 {
        return None;
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    (buf.len() > len).then_some(len + 1)
}

impl BackendMessage {
    /// Decode a message from wire bytes.
    ///
    /// Returns the message and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), String> {
        if buf.len() < 5 {
            return Err("Buffer too short".to_string());
        }

        let msg_type = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(format!("Invalid message length: {}", len));
        }
        let len = len as usize;

        if buf.len() < len + 1 {
            return Err("Incomplete message".to_string());
        }

        let mut payload = Payload::new(&buf[5..len + 1]);

        let message = match msg_type {
            b'R' => Self::decode_auth(&mut payload)?,
            b'S' => BackendMessage::ParameterStatus {
                name: payload.cstr()?,
                value: payload.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: payload.i32()?,
                secret_key: payload.i32()?,
            },
            b'Z' => Self::decode_ready_for_query(&mut payload)?,
            b'T' => Self::decode_row_description(&mut payload)?,
            b'D' => Self::decode_data_row(&mut payload)?,
            b'C' => BackendMessage::CommandComplete(payload.cstr()?),
            b'E' => BackendMessage::ErrorResponse(Self::parse_error_fields(&mut payload)?),
            b'N' => BackendMessage::NoticeResponse(Self::parse_error_fields(&mut payload)?),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b'G' => BackendMessage::CopyInResponse,
            b'H' => BackendMessage::CopyOutResponse,
            b'd' => BackendMessage::CopyData(payload.rest().to_vec()),
            b'c' => BackendMessage::CopyDone,
            b'A' => BackendMessage::NotificationResponse {
                process_id: payload.i32()?,
                channel: payload.cstr()?,
                payload: payload.cstr()?,
            },
            b'I' => BackendMessage::EmptyQueryResponse,
            _ => return Err(format!("Unknown message type: {}", msg_type as char)),
        };

        Ok((message, len + 1))
    }

    fn decode_auth(payload: &mut Payload<'_>) -> Result<Self, String> {
        let auth_type = payload.i32()?;
        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let salt = payload.take(4)?;
                Ok(BackendMessage::AuthenticationMD5Password([
                    salt[0], salt[1], salt[2], salt[3],
                ]))
            }
            10 => {
                // SASL - parse mechanism list
                let mut mechanisms = Vec::new();
                while !payload.at_end() {
                    let mechanism = payload.cstr()?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                Ok(BackendMessage::AuthenticationSASL(mechanisms))
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue(
                payload.rest().to_vec(),
            )),
            12 => Ok(BackendMessage::AuthenticationSASLFinal(
                payload.rest().to_vec(),
            )),
            _ => Err(format!("Unsupported authentication method: {}", auth_type)),
        }
    }

    fn decode_ready_for_query(payload: &mut Payload<'_>) -> Result<Self, String> {
        let status = match payload.u8()? {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InBlock,
            b'E' => TransactionStatus::Failed,
            _ => return Err("Unknown transaction status".to_string()),
        };
        Ok(BackendMessage::ReadyForQuery(status))
    }

    fn decode_row_description(payload: &mut Payload<'_>) -> Result<Self, String> {
        let field_count = payload.i16()?.max(0) as usize;
        let mut fields = Vec::with_capacity(field_count);

        for _ in 0..field_count {
            fields.push(FieldDescription {
                name: payload.cstr()?,
                table_oid: payload.i32()? as u32,
                column_attr: payload.i16()?,
                type_oid: payload.i32()? as u32,
                type_size: payload.i16()?,
                type_modifier: payload.i32()?,
                format: payload.i16()?,
            });
        }

        Ok(BackendMessage::RowDescription(fields))
    }

    fn decode_data_row(payload: &mut Payload<'_>) -> Result<Self, String> {
        let column_count = payload.i16()?.max(0) as usize;
        let mut columns = Vec::with_capacity(column_count);

        for _ in 0..column_count {
            let len = payload.i32()?;
            if len < 0 {
                // NULL value
                columns.push(None);
            } else {
                columns.push(Some(payload.take(len as usize)?.to_vec()));
            }
        }

        Ok(BackendMessage::DataRow(columns))
    }

    fn parse_error_fields(payload: &mut Payload<'_>) -> Result<ErrorFields, String> {
        let mut fields = ErrorFields::default();
        loop {
            let field_type = payload.u8()?;
            if field_type == 0 {
                break;
            }
            let value = payload.cstr()?;

            match field_type {
                b'S' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = Some(value),
                _ => {}
            }
        }
        Ok(fields)
    }
}
