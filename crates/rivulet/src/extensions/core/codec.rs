use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo};
use crate::{bitfield::Bitfield, error::Error};

/// Messages larger than this are a protocol violation. The largest
/// legitimate message is a bitfield of a torrent with millions of pieces.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// The first value is decided when the peer sends its extension header, in the
/// m field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedMessage(pub u8, pub Vec<u8>);

impl From<ExtendedMessage> for Core {
    fn from(value: ExtendedMessage) -> Self {
        Self::Extended(value)
    }
}

/// Core messages exchanged after a successful handshake.
/// These are from the vanilla protocol, plus the extension message.
#[derive(Debug, Clone, PartialEq)]
pub enum Core {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    /// DHT listen port of the remote.
    Port(u16),
    Extended(ExtendedMessage),
}

/// The IDs of the [`Core`] messages.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoreId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for CoreId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use CoreId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            9 => Port,
            20 => Extended,
            v => return Err(v),
        })
    }
}

impl CoreId {
    /// Length of the payload (after the id) for messages of fixed size.
    fn fixed_payload_len(self) -> Option<usize> {
        use CoreId::*;
        match self {
            Choke | Unchoke | Interested | NotInterested => Some(0),
            Have => Some(4),
            Request | Cancel => Some(12),
            Port => Some(2),
            Bitfield | Piece | Extended => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoreCodec;

impl Encoder<Core> for CoreCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Core,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Core::KeepAlive => {
                buf.put_u32(0);
            }
            Core::Choke => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Choke as u8);
            }
            Core::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Unchoke as u8);
            }
            Core::Interested => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Interested as u8);
            }
            Core::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(CoreId::NotInterested as u8);
            }
            Core::Have(piece_index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(CoreId::Have as u8);
                buf.put_u32(piece_index);
            }
            Core::Bitfield(bitfield) => {
                let v = bitfield.as_raw_slice();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(CoreId::Bitfield as u8);
                buf.extend_from_slice(v);
            }
            // <len=0013><id=6><index><begin><length>
            Core::Request(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(CoreId::Request as u8);
                block.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Core::Piece(Block { index, begin, block }) => {
                buf.put_u32(1 + 4 + 4 + block.len() as u32);
                buf.put_u8(CoreId::Piece as u8);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.extend_from_slice(&block);
            }
            Core::Cancel(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(CoreId::Cancel as u8);
                block.encode(buf);
            }
            Core::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(CoreId::Port as u8);
                buf.put_u16(port);
            }
            // <len=0002+X><id=20><ext_id><payload>
            Core::Extended(ExtendedMessage(ext_id, payload)) => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(CoreId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for CoreCodec {
    type Item = Core;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // the message length header must be present at the minimum,
            // otherwise we can't determine the message type
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at length prefix without consuming
            let size =
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if size == 0 {
                buf.advance(4);
                return Ok(Some(Core::KeepAlive));
            }

            if size > MAX_MESSAGE_SIZE {
                return Err(Error::MessageTooLarge(size));
            }

            // incomplete message, wait for the rest of the frame without
            // advancing the cursor.
            if buf.len() < 4 + size {
                buf.reserve(4 + size - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let msg_id = buf.get_u8();

            let Ok(msg_id) = CoreId::try_from(msg_id) else {
                warn!("unknown message_id {msg_id:?}, skipping {size} bytes");
                buf.advance(size - 1);
                continue;
            };

            let payload_len = size - 1;
            if let Some(expected) = msg_id.fixed_payload_len() {
                if payload_len != expected {
                    return Err(Error::MessageInvalid("wrong fixed length"));
                }
            }

            let msg = match msg_id {
                CoreId::Choke => Core::Choke,
                CoreId::Unchoke => Core::Unchoke,
                CoreId::Interested => Core::Interested,
                CoreId::NotInterested => Core::NotInterested,

                // <len=0005><id=4><piece index>
                CoreId::Have => Core::Have(buf.get_u32()),

                // <len=0001+X><id=5><bitfield>
                CoreId::Bitfield => {
                    let bitfield = buf.split_to(payload_len).to_vec();
                    Core::Bitfield(Bitfield::from_vec(bitfield))
                }

                // <len=0013><id=6><index><begin><length>
                CoreId::Request => Core::Request(BlockInfo {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    len: buf.get_u32(),
                }),

                // <len=0009+X><id=7><index><begin><block>
                CoreId::Piece => {
                    if payload_len < 8 {
                        return Err(Error::MessageInvalid("short piece"));
                    }
                    let index = buf.get_u32();
                    let begin = buf.get_u32();
                    let block = buf.split_to(payload_len - 8).to_vec();
                    Core::Piece(Block { index, begin, block })
                }

                // <len=0013><id=8><index><begin><length>
                CoreId::Cancel => Core::Cancel(BlockInfo {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    len: buf.get_u32(),
                }),

                // <len=0003><id=9><listen-port>
                CoreId::Port => Core::Port(buf.get_u16()),

                // <len=0002+X><id=20><ext_id><payload>
                CoreId::Extended => {
                    if payload_len < 1 {
                        return Err(Error::MessageInvalid("short extended"));
                    }
                    let ext_id = buf.get_u8();
                    let payload = buf.split_to(payload_len - 1).to_vec();
                    Core::Extended(ExtendedMessage(ext_id, payload))
                }
            };

            return Ok(Some(msg));
        }
    }
}
