use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, Result, MAX_PACKET_SIZE};
use super::packet::{ClientPacket, PacketKind, ServerPacket};

/// Smallest parseable frame: header, type byte, and one body byte
const MIN_FRAME_LEN: usize = 9;

/// Computes the IEEE CRC32 of the checksummed region (0xFF byte onwards)
fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn assemble(payload: BytesMut) -> Result<Bytes> {
    let total = payload.len() + 6;
    if total > MAX_PACKET_SIZE {
        return Err(Error::PacketTooLarge(total - MAX_PACKET_SIZE));
    }

    let mut frame = BytesMut::with_capacity(total);
    frame.put_slice(b"BE");
    frame.put_u32_le(checksum(&payload));
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

fn payload_buffer(kind: PacketKind, body_len: usize) -> BytesMut {
    let mut payload = BytesMut::with_capacity(2 + body_len);
    payload.put_u8(0xFF);
    payload.put_u8(kind.as_byte());
    payload
}

/// Serializes a client packet into a datagram
pub fn encode_client(packet: &ClientPacket) -> Result<Bytes> {
    let mut payload;
    match packet {
        ClientPacket::Login { password } => {
            if password.contains(&0x00) {
                return Err(Error::malformed("login password cannot have a null byte"));
            }
            payload = payload_buffer(PacketKind::Login, password.len());
            payload.put_slice(password);
        }
        ClientPacket::Command { sequence, command } => {
            payload = payload_buffer(PacketKind::Command, 1 + command.len());
            payload.put_u8(*sequence);
            payload.put_slice(command);
        }
        ClientPacket::Message { sequence } => {
            payload = payload_buffer(PacketKind::Message, 1);
            payload.put_u8(*sequence);
        }
    }
    assemble(payload)
}

/// Serializes a server packet into a datagram
pub fn encode_server(packet: &ServerPacket) -> Result<Bytes> {
    let mut payload;
    match packet {
        ServerPacket::Login { success } => {
            payload = payload_buffer(PacketKind::Login, 1);
            payload.put_u8(u8::from(*success));
        }
        ServerPacket::Command { sequence, total, index, payload: body } => {
            if *total == 0 {
                return Err(Error::malformed("multipart total must be 1 or higher"));
            }
            if index >= total {
                return Err(Error::malformed(format!(
                    "multipart index {index} cannot equal or exceed total {total}"
                )));
            }
            payload = payload_buffer(PacketKind::Command, 4 + body.len());
            payload.put_u8(*sequence);
            if *total != 1 {
                payload.put_u8(0x00);
                payload.put_u8(*total);
                payload.put_u8(*index);
            }
            payload.put_slice(body);
        }
        ServerPacket::Message { sequence, message } => {
            payload = payload_buffer(PacketKind::Message, 1 + message.len());
            payload.put_u8(*sequence);
            payload.put_slice(message);
        }
    }
    assemble(payload)
}

/// Validates the frame header and checksum, returning the type byte and body
fn split_frame(data: &[u8]) -> Result<(PacketKind, &[u8])> {
    if data.len() < MIN_FRAME_LEN {
        return Err(Error::malformed("insufficient data provided"));
    }
    if &data[..2] != b"BE" {
        return Err(Error::malformed("expected BE at start of header"));
    }

    let declared = u32::from_le_bytes([data[2], data[3], data[4], data[5]]);
    if declared != checksum(&data[6..]) {
        return Err(Error::ChecksumMismatch);
    }

    if data[6] != 0xFF {
        return Err(Error::malformed("expected 0xFF at end of header"));
    }
    let kind = PacketKind::from_byte(data[7])
        .ok_or_else(|| Error::malformed(format!("unknown packet type: {}", data[7])))?;

    Ok((kind, &data[8..]))
}

/// Parses a datagram sent by the server
pub fn decode_server(data: &[u8]) -> Result<ServerPacket> {
    let (kind, body) = split_frame(data)?;

    match kind {
        PacketKind::Login => {
            if body.len() != 1 {
                return Err(Error::malformed(
                    "unexpected excess data after authentication byte",
                ));
            }
            match body[0] {
                0 => Ok(ServerPacket::Login { success: false }),
                1 => Ok(ServerPacket::Login { success: true }),
                byte => Err(Error::malformed(format!(
                    "authentication byte must be 0 or 1, not {byte}"
                ))),
            }
        }

        PacketKind::Command => {
            let sequence = body[0];
            let (total, index, payload) = if body.len() > 1 && body[1] == 0x00 {
                if body.len() < 4 {
                    return Err(Error::malformed("truncated multipart header"));
                }
                (body[2], body[3], &body[4..])
            } else {
                (1, 0, &body[1..])
            };

            if index >= total {
                return Err(Error::malformed(format!(
                    "multipart index {index} cannot equal or exceed total {total}"
                )));
            }

            Ok(ServerPacket::Command {
                sequence,
                total,
                index,
                payload: Bytes::copy_from_slice(payload),
            })
        }

        PacketKind::Message => Ok(ServerPacket::Message {
            sequence: body[0],
            message: Bytes::copy_from_slice(&body[1..]),
        }),
    }
}

/// Parses a datagram sent by the client
pub fn decode_client(data: &[u8]) -> Result<ClientPacket> {
    let (kind, body) = split_frame(data)?;

    match kind {
        PacketKind::Login => {
            if body.contains(&0x00) {
                return Err(Error::malformed("login password cannot have a null byte"));
            }
            Ok(ClientPacket::Login {
                password: Bytes::copy_from_slice(body),
            })
        }

        PacketKind::Command => Ok(ClientPacket::Command {
            sequence: body[0],
            command: Bytes::copy_from_slice(&body[1..]),
        }),

        PacketKind::Message => Ok(ClientPacket::Message { sequence: body[0] }),
    }
}

/// Client-side packet codec for encoding/decoding datagrams
///
/// One datagram carries exactly one frame, so `decode` always consumes
/// the entire buffer.
#[derive(Clone, Default)]
pub struct PacketCodec;

impl PacketCodec {
    /// Creates a new packet codec
    pub fn new() -> Self {
        PacketCodec
    }
}

impl Decoder for PacketCodec {
    type Item = ServerPacket;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        let datagram = src.split();
        decode_server(&datagram).map(Some)
    }
}

impl Encoder<ClientPacket> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, item: ClientPacket, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&encode_client(&item)?);
        Ok(())
    }
}
