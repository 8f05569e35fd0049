//! Hand-rolled WebSocket framing.
//!
//! Covers what the hub and connector need: text, close, ping, and pong frames,
//! masked client frames, fragment reassembly, and the upgrade handshake.

pub mod decoder;
pub mod frame;
pub mod handshake;

pub use decoder::FrameDecoder;
pub use frame::{
    Decoded, MAX_CONTROL_PAYLOAD, MAX_FRAME_PAYLOAD, Message, Opcode, close_frame,
    decode_frames, encode_frame, encode_masked_text, encode_text, ping_frame, pong_frame,
};
pub use handshake::accept_key;
