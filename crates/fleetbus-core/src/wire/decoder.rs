//! Incremental frame decoder for stream readers.

use fleetbus_types::error::WireError;

use super::frame::{
    MAX_FRAME_PAYLOAD, Message, Opcode, RawFrame, control_message, data_message, parse_frame,
};

/// Which end of the connection the decoder reads for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Reads client frames, which must be masked.
    Server,
    /// Reads server frames, which must not be.
    Client,
}

/// A data message whose final fragment has not arrived yet.
#[derive(Debug)]
struct Fragment {
    opcode: Opcode,
    data: Vec<u8>,
}

/// Accumulates bytes from a socket and yields messages as they complete.
///
/// TCP may split a frame across reads or pack several frames into one; the
/// decoder keeps the unparsed tail between calls to [`FrameDecoder::feed`].
/// Fragments are moved out of the byte buffer as soon as their frame is
/// complete, so each byte is parsed once and control frames interleaved with
/// a fragmented message are delivered immediately.
#[derive(Debug)]
pub struct FrameDecoder {
    role: Role,
    buffer: Vec<u8>,
    fragment: Option<Fragment>,
}

impl FrameDecoder {
    /// Decoder for the hub side: every incoming frame must be masked.
    pub fn server() -> Self {
        Self::with_role(Role::Server)
    }

    /// Decoder for the agent side: incoming frames must be unmasked.
    pub fn client() -> Self {
        Self::with_role(Role::Client)
    }

    fn with_role(role: Role) -> Self {
        Self {
            role,
            buffer: Vec::new(),
            fragment: None,
        }
    }

    /// Append freshly read bytes and return every message now complete.
    ///
    /// Any error leaves the connection unusable; the caller should close it.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, WireError> {
        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();
        let mut offset = 0;

        while let Some((frame, used)) = parse_frame(&self.buffer[offset..])? {
            offset += used;
            self.check_mask(&frame)?;
            if let Some(message) = self.accept(frame)? {
                messages.push(message);
            }
        }

        self.buffer.drain(..offset);
        Ok(messages)
    }

    /// Bytes held back waiting for the rest of a frame or message.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.fragment.as_ref().map_or(0, |f| f.data.len())
    }

    fn check_mask(&self, frame: &RawFrame) -> Result<(), WireError> {
        match (self.role, frame.masked) {
            (Role::Server, false) => Err(WireError::UnmaskedClientFrame),
            (Role::Client, true) => Err(WireError::MaskedServerFrame),
            _ => Ok(()),
        }
    }

    fn accept(&mut self, frame: RawFrame) -> Result<Option<Message>, WireError> {
        if frame.opcode.is_control() {
            return control_message(frame.opcode, frame.payload).map(Some);
        }

        match (frame.opcode, self.fragment.take()) {
            (Opcode::Continuation, None) => Err(WireError::UnexpectedContinuation),
            (Opcode::Continuation, Some(mut open)) => {
                let len = (open.data.len() + frame.payload.len()) as u64;
                if len > MAX_FRAME_PAYLOAD {
                    return Err(WireError::MessageTooLarge {
                        len,
                        limit: MAX_FRAME_PAYLOAD,
                    });
                }
                open.data.extend_from_slice(&frame.payload);
                if frame.fin {
                    data_message(open.opcode, open.data).map(Some)
                } else {
                    self.fragment = Some(open);
                    Ok(None)
                }
            }
            (_, Some(_)) => Err(WireError::InterleavedDataFrame),
            (opcode, None) if frame.fin => data_message(opcode, frame.payload).map(Some),
            (opcode, None) => {
                self.fragment = Some(Fragment {
                    opcode,
                    data: frame.payload,
                });
                Ok(None)
            }
        }
    }
}
