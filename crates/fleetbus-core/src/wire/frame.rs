//! WebSocket frame encoding and decoding (RFC 6455 subset).
//!
//! Server frames go out unmasked, client frames carry a 4-byte mask key.
//! [`decode_frames`] accepts either and works on a caller-held buffer; the
//! stream decoder in [`super::decoder`] also enforces the masking rule for
//! its side of the connection.

use fleetbus_types::error::WireError;

/// Largest payload accepted for a single frame or a reassembled message.
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Frame opcodes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WireError::UnsupportedOpcode(other)),
        }
    }
}

/// One decoded application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Close { code: Option<u16>, reason: String },
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl Message {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Output of [`decode_frames`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    pub messages: Vec<Message>,
    /// Bytes that did not form a complete message; prepend them to the next read.
    pub remaining: Vec<u8>,
}

/// Build one complete frame with FIN set.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 14);
    out.push(0x80 | opcode.bits());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        out.push(mask_bit | 126);
        out.extend_from_slice(&short.to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Unmasked text frame, as sent by the hub.
pub fn encode_text(text: &str) -> Vec<u8> {
    encode_frame(Opcode::Text, text.as_bytes(), None)
}

/// Masked text frame, as sent by a client.
pub fn encode_masked_text(text: &str, mask: [u8; 4]) -> Vec<u8> {
    encode_frame(Opcode::Text, text.as_bytes(), Some(mask))
}

/// Close frame carrying a status code.
pub fn close_frame(code: u16) -> Vec<u8> {
    encode_frame(Opcode::Close, &code.to_be_bytes(), None)
}

pub fn ping_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(Opcode::Ping, payload, None)
}

pub fn pong_frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(Opcode::Pong, payload, None)
}

/// One frame as it appeared on the wire, payload already unmasked.
#[derive(Debug)]
pub(crate) struct RawFrame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Whether the sender masked the payload.
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// Parse a single frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame and the
/// number of bytes it occupied. Size limits are checked from the header, so
/// an oversized frame fails before its payload arrives.
pub(crate) fn parse_frame(buf: &[u8]) -> Result<Option<(RawFrame, usize)>, WireError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::try_from(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;

    let (len, mut pos) = match buf[1] & 0x7F {
        126 => {
            let Some(bytes) = buf.get(2..4) else {
                return Ok(None);
            };
            (u64::from(u16::from_be_bytes([bytes[0], bytes[1]])), 4)
        }
        127 => {
            let Some(bytes) = buf.get(2..10) else {
                return Ok(None);
            };
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            (u64::from_be_bytes(raw), 10)
        }
        short => (u64::from(short), 2),
    };

    if opcode.is_control() && (!fin || len > MAX_CONTROL_PAYLOAD) {
        return Err(WireError::InvalidControlFrame { len });
    }
    if len > MAX_FRAME_PAYLOAD {
        return Err(WireError::FrameTooLarge {
            len,
            limit: MAX_FRAME_PAYLOAD,
        });
    }

    let mask = if masked {
        let Some(key) = buf.get(pos..pos + 4) else {
            return Ok(None);
        };
        pos += 4;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };

    // Bounded by MAX_FRAME_PAYLOAD above, so this fits in usize.
    let len = len as usize;
    let Some(data) = buf.get(pos..pos + len) else {
        return Ok(None);
    };
    let payload = match mask {
        Some(key) => data.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect(),
        None => data.to_vec(),
    };

    Ok(Some((
        RawFrame {
            fin,
            opcode,
            masked,
            payload,
        },
        pos + len,
    )))
}

pub(crate) fn data_message(opcode: Opcode, payload: Vec<u8>) -> Result<Message, WireError> {
    match opcode {
        Opcode::Binary => Ok(Message::Binary(payload)),
        _ => String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| WireError::InvalidUtf8),
    }
}

pub(crate) fn control_message(opcode: Opcode, payload: Vec<u8>) -> Result<Message, WireError> {
    Ok(match opcode {
        Opcode::Ping => Message::Ping(payload),
        Opcode::Pong => Message::Pong(payload),
        _ => {
            let code = payload
                .get(..2)
                .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]));
            let reason = payload
                .get(2..)
                .map(|rest| String::from_utf8_lossy(rest).into_owned())
                .unwrap_or_default();
            Message::Close { code, reason }
        }
    })
}

/// Decode every complete message in `buf`.
///
/// Trailing bytes that do not yet form a complete message are returned in
/// `remaining`. When a fragmented message is cut off mid-way, `remaining`
/// starts at its first fragment, and control frames seen after that point are
/// left to be decoded again on the next call.
pub fn decode_frames(buf: &[u8]) -> Result<Decoded, WireError> {
    let mut messages: Vec<(usize, Message)> = Vec::new();
    let mut offset = 0;
    // (offset of first fragment, opcode, collected payload)
    let mut fragment: Option<(usize, Opcode, Vec<u8>)> = None;

    while let Some((frame, used)) = parse_frame(&buf[offset..])? {
        let start = offset;
        offset += used;

        if frame.opcode.is_control() {
            messages.push((start, control_message(frame.opcode, frame.payload)?));
            continue;
        }

        match (frame.opcode, fragment.take()) {
            (Opcode::Continuation, None) => return Err(WireError::UnexpectedContinuation),
            (Opcode::Continuation, Some((first, opcode, mut data))) => {
                let len = (data.len() + frame.payload.len()) as u64;
                if len > MAX_FRAME_PAYLOAD {
                    return Err(WireError::MessageTooLarge {
                        len,
                        limit: MAX_FRAME_PAYLOAD,
                    });
                }
                data.extend_from_slice(&frame.payload);
                if frame.fin {
                    messages.push((first, data_message(opcode, data)?));
                } else {
                    fragment = Some((first, opcode, data));
                }
            }
            (_, Some(_)) => return Err(WireError::InterleavedDataFrame),
            (opcode, None) if frame.fin => {
                messages.push((start, data_message(opcode, frame.payload)?));
            }
            (opcode, None) => fragment = Some((start, opcode, frame.payload)),
        }
    }

    let cut = match &fragment {
        Some((first, _, _)) => *first,
        None => offset,
    };
    Ok(Decoded {
        messages: messages
            .into_iter()
            .filter(|(start, _)| *start < cut)
            .map(|(_, message)| message)
            .collect(),
        remaining: buf[cut..].to_vec(),
    })
}
