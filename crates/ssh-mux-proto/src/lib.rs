//! Typed messages for the SSH connection protocol (RFC 4254, channel subset).
//!
//! Only the payload of each message is encoded here; packet framing, MAC and
//! encryption belong to the transport layer.

use core::fmt;

use bytes::{Buf as _, BufMut as _};
use smol_str::SmolStr;

// We re-export these types, because they are used in the public API.
#[rustfmt::skip]
pub use bytes::{Bytes, BytesMut};

/// Distant identifier for a channel
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct DistantChannelId(u32);

impl From<u32> for DistantChannelId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<DistantChannelId> for u32 {
    fn from(id: DistantChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for DistantChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d#{}", self.0)
    }
}

/// Local identifier for a channel
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct LocalChannelId(u32);

impl From<u32> for LocalChannelId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<LocalChannelId> for u32 {
    fn from(id: LocalChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for LocalChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l#{}", self.0)
    }
}

/// Kind of a channel, with its open-time parameters.
///
/// Ports are `u16` in memory even though RFC 4254 encodes them as `uint32`.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum ChannelType {
    Session,
    DirectTcpIp {
        target_host: SmolStr,
        target_port: u16,
        originator_host: SmolStr,
        originator_port: u16,
    },
    ForwardedTcpIp {
        listening_host: SmolStr,
        listening_port: u16,
        originator_host: SmolStr,
        originator_port: u16,
    },
}

impl ChannelType {
    pub const SESSION_NAME: &'static str = "session";
    pub const DIRECT_TCPIP_NAME: &'static str = "direct-tcpip";
    pub const FORWARDED_TCPIP_NAME: &'static str = "forwarded-tcpip";

    pub fn name(&self) -> &'static str {
        match self {
            ChannelType::Session => Self::SESSION_NAME,
            ChannelType::DirectTcpIp { .. } => Self::DIRECT_TCPIP_NAME,
            ChannelType::ForwardedTcpIp { .. } => Self::FORWARDED_TCPIP_NAME,
        }
    }

    fn type_specific_size(&self) -> usize {
        match self {
            ChannelType::Session => 0,
            ChannelType::DirectTcpIp {
                target_host,
                originator_host,
                ..
            } => string_size(target_host.as_bytes()) + 4 + string_size(originator_host.as_bytes()) + 4,
            ChannelType::ForwardedTcpIp {
                listening_host,
                originator_host,
                ..
            } => string_size(listening_host.as_bytes()) + 4 + string_size(originator_host.as_bytes()) + 4,
        }
    }

    fn encode_type_specific(&self, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            ChannelType::Session => Ok(()),
            ChannelType::DirectTcpIp {
                target_host,
                target_port,
                originator_host,
                originator_port,
            } => {
                put_string(buf, target_host.as_bytes())?;
                buf.put_u32(u32::from(*target_port));
                put_string(buf, originator_host.as_bytes())?;
                buf.put_u32(u32::from(*originator_port));
                Ok(())
            }
            ChannelType::ForwardedTcpIp {
                listening_host,
                listening_port,
                originator_host,
                originator_port,
            } => {
                put_string(buf, listening_host.as_bytes())?;
                buf.put_u32(u32::from(*listening_port));
                put_string(buf, originator_host.as_bytes())?;
                buf.put_u32(u32::from(*originator_port));
                Ok(())
            }
        }
    }

    fn decode_type_specific(name: &str, buf: &mut Bytes) -> Result<Self, Error> {
        match name {
            Self::SESSION_NAME => Ok(ChannelType::Session),
            Self::DIRECT_TCPIP_NAME => {
                let target_host = get_utf8_string(buf, ChannelOpen::NAME, "targetHost")?;
                let target_port = get_port(buf, ChannelOpen::NAME, "targetPort")?;
                let originator_host = get_utf8_string(buf, ChannelOpen::NAME, "originatorHost")?;
                let originator_port = get_port(buf, ChannelOpen::NAME, "originatorPort")?;
                Ok(ChannelType::DirectTcpIp {
                    target_host,
                    target_port,
                    originator_host,
                    originator_port,
                })
            }
            Self::FORWARDED_TCPIP_NAME => {
                let listening_host = get_utf8_string(buf, ChannelOpen::NAME, "listeningHost")?;
                let listening_port = get_port(buf, ChannelOpen::NAME, "listeningPort")?;
                let originator_host = get_utf8_string(buf, ChannelOpen::NAME, "originatorHost")?;
                let originator_port = get_port(buf, ChannelOpen::NAME, "originatorPort")?;
                Ok(ChannelType::ForwardedTcpIp {
                    listening_host,
                    listening_port,
                    originator_host,
                    originator_port,
                })
            }
            _ => Err(Error::InvalidPacket {
                name: ChannelOpen::NAME,
                field: "channelType",
                reason: "unknown channel type",
            }),
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stream addressed by an extended-data message, or the main channel stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Channel,
    Stderr,
    Other(u32),
}

pub const EXTENDED_DATA_STDERR: u32 = 1;

impl DataType {
    pub fn from_extended_code(code: u32) -> Self {
        match code {
            EXTENDED_DATA_STDERR => DataType::Stderr,
            other => DataType::Other(other),
        }
    }

    /// `None` for the main channel stream.
    pub fn extended_code(self) -> Option<u32> {
        match self {
            DataType::Channel => None,
            DataType::Stderr => Some(EXTENDED_DATA_STDERR),
            DataType::Other(code) => Some(code),
        }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    PacketOversized {
        packet_size: usize,
        max: usize,
    },
    NotEnoughBytes {
        name: &'static str,
        received: usize,
        expected: usize,
    },
    InvalidPacket {
        name: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PacketOversized { packet_size, max } => {
                write!(f, "packet oversized: max is {max}, got {packet_size}")
            }
            Error::NotEnoughBytes {
                name,
                received,
                expected,
            } => write!(
                f,
                "not enough bytes provided to decode {name}: received {received} bytes, expected {expected} bytes"
            ),
            Error::InvalidPacket { name, field, reason } => {
                write!(f, "invalid `{field}` in {name}: {reason}")
            }
        }
    }
}

macro_rules! ensure_size {
    ($buf:ident [$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if !(received >= expected) {
            return Err(Error::NotEnoughBytes {
                name: $name,
                received,
                expected,
            });
        }
    }};
    (plain $packet_struct:ident in $buf:ident) => {{
        ensure_size!($buf[$packet_struct::SIZE] for $packet_struct::NAME)
    }};
    (fixed $packet_struct:ident in $buf:ident) => {{
        ensure_size!($buf[$packet_struct::FIXED_PART_SIZE] for $packet_struct::NAME)
    }};
}

fn string_size(bytes: &[u8]) -> usize {
    4 + bytes.len()
}

fn put_string(buf: &mut BytesMut, bytes: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(bytes.len()).map_err(|_| Error::PacketOversized {
        packet_size: bytes.len(),
        max: u32::MAX as usize,
    })?;
    buf.put_u32(len);
    buf.put(bytes);
    Ok(())
}

fn get_string(buf: &mut Bytes, name: &'static str, _field: &'static str) -> Result<Bytes, Error> {
    ensure_size!(buf[4] for name);
    let len = buf.get_u32() as usize;
    ensure_size!(buf[len] for name);
    Ok(buf.split_to(len))
}

fn get_utf8_string(buf: &mut Bytes, name: &'static str, field: &'static str) -> Result<SmolStr, Error> {
    let bytes = get_string(buf, name, field)?;
    let s = std::str::from_utf8(&bytes).map_err(|_| Error::InvalidPacket {
        name,
        field,
        reason: "not valid UTF-8",
    })?;
    Ok(SmolStr::new(s))
}

fn get_port(buf: &mut Bytes, name: &'static str, field: &'static str) -> Result<u16, Error> {
    ensure_size!(buf[4] for name);
    let port = buf.get_u32();
    u16::try_from(port).map_err(|_| Error::InvalidPacket {
        name,
        field,
        reason: "port out of range",
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    Open(ChannelOpen),
    OpenConfirmation(ChannelOpenConfirmation),
    OpenFailure(ChannelOpenFailure),
    WindowAdjust(ChannelWindowAdjust),
    Data(ChannelData),
    ExtendedData(ChannelExtendedData),
    Eof(ChannelEof),
    Close(ChannelClose),
    Request(ChannelRequest),
    Success(ChannelSuccess),
    Failure(ChannelFailure),
}

impl Message {
    pub fn open(id: LocalChannelId, initial_window_size: u32, maximum_packet_size: u32, channel_type: ChannelType) -> Self {
        Self::Open(ChannelOpen::new(id, initial_window_size, maximum_packet_size, channel_type))
    }

    pub fn open_confirmation(
        distant_id: DistantChannelId,
        local_id: LocalChannelId,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self::OpenConfirmation(ChannelOpenConfirmation::new(
            distant_id,
            local_id,
            initial_window_size,
            maximum_packet_size,
        ))
    }

    pub fn open_failure(distant_id: DistantChannelId, reason_code: ReasonCode, description: impl Into<String>) -> Self {
        Self::OpenFailure(ChannelOpenFailure::new(distant_id, reason_code, description))
    }

    pub fn window_adjust(distant_id: DistantChannelId, bytes_to_add: u32) -> Self {
        Self::WindowAdjust(ChannelWindowAdjust::new(distant_id, bytes_to_add))
    }

    pub fn data(distant_id: DistantChannelId, data: Bytes) -> Self {
        Self::Data(ChannelData::new(distant_id, data))
    }

    pub fn extended_data(distant_id: DistantChannelId, data_type_code: u32, data: Bytes) -> Self {
        Self::ExtendedData(ChannelExtendedData::new(distant_id, data_type_code, data))
    }

    pub fn eof(distant_id: DistantChannelId) -> Self {
        Self::Eof(ChannelEof::new(distant_id))
    }

    pub fn close(distant_id: DistantChannelId) -> Self {
        Self::Close(ChannelClose::new(distant_id))
    }

    pub fn request(
        distant_id: DistantChannelId,
        request_type: impl Into<SmolStr>,
        want_reply: bool,
        type_specific: Bytes,
    ) -> Self {
        Self::Request(ChannelRequest::new(distant_id, request_type, want_reply, type_specific))
    }

    pub fn success(distant_id: DistantChannelId) -> Self {
        Self::Success(ChannelSuccess::new(distant_id))
    }

    pub fn failure(distant_id: DistantChannelId) -> Self {
        Self::Failure(ChannelFailure::new(distant_id))
    }

    /// Payload length including the leading message-type byte.
    pub fn size(&self) -> usize {
        let body = match self {
            Message::Open(msg) => msg.size(),
            Message::OpenConfirmation(_) => ChannelOpenConfirmation::SIZE,
            Message::OpenFailure(msg) => msg.size(),
            Message::WindowAdjust(_) => ChannelWindowAdjust::SIZE,
            Message::Data(msg) => msg.size(),
            Message::ExtendedData(msg) => msg.size(),
            Message::Eof(_) => ChannelEof::SIZE,
            Message::Close(_) => ChannelClose::SIZE,
            Message::Request(msg) => msg.size(),
            Message::Success(_) => ChannelSuccess::SIZE,
            Message::Failure(_) => ChannelFailure::SIZE,
        };
        1 + body
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::OpenConfirmation(_) => MessageType::OpenConfirmation,
            Message::OpenFailure(_) => MessageType::OpenFailure,
            Message::WindowAdjust(_) => MessageType::WindowAdjust,
            Message::Data(_) => MessageType::Data,
            Message::ExtendedData(_) => MessageType::ExtendedData,
            Message::Eof(_) => MessageType::Eof,
            Message::Close(_) => MessageType::Close,
            Message::Request(_) => MessageType::Request,
            Message::Success(_) => MessageType::Success,
            Message::Failure(_) => MessageType::Failure,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let len = self.size();
        if buf.len() < len {
            buf.reserve(len - buf.len());
        }
        buf.put_u8(self.message_type() as u8);

        match self {
            Message::Open(msg) => msg.encode(buf),
            Message::OpenConfirmation(msg) => {
                msg.encode(buf);
                Ok(())
            }
            Message::OpenFailure(msg) => msg.encode(buf),
            Message::WindowAdjust(msg) => {
                msg.encode(buf);
                Ok(())
            }
            Message::Data(msg) => msg.encode(buf),
            Message::ExtendedData(msg) => msg.encode(buf),
            Message::Eof(msg) => {
                msg.encode(buf);
                Ok(())
            }
            Message::Close(msg) => {
                msg.encode(buf);
                Ok(())
            }
            Message::Request(msg) => msg.encode(buf),
            Message::Success(msg) => {
                msg.encode(buf);
                Ok(())
            }
            Message::Failure(msg) => {
                msg.encode(buf);
                Ok(())
            }
        }
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[1] for "MESSAGE TYPE");
        let ty = MessageType::try_from(buf.get_u8())?;

        let message = match ty {
            MessageType::Open => Self::Open(ChannelOpen::decode(buf)?),
            MessageType::OpenConfirmation => Self::OpenConfirmation(ChannelOpenConfirmation::decode(buf)?),
            MessageType::OpenFailure => Self::OpenFailure(ChannelOpenFailure::decode(buf)?),
            MessageType::WindowAdjust => Self::WindowAdjust(ChannelWindowAdjust::decode(buf)?),
            MessageType::Data => Self::Data(ChannelData::decode(buf)?),
            MessageType::ExtendedData => Self::ExtendedData(ChannelExtendedData::decode(buf)?),
            MessageType::Eof => Self::Eof(ChannelEof::decode(buf)?),
            MessageType::Close => Self::Close(ChannelClose::decode(buf)?),
            MessageType::Request => Self::Request(ChannelRequest::decode(buf)?),
            MessageType::Success => Self::Success(ChannelSuccess::decode(buf)?),
            MessageType::Failure => Self::Failure(ChannelFailure::decode(buf)?),
        };

        Ok(message)
    }

    /// Channel the peer addressed, when the message carries one.
    ///
    /// `channelOpen` carries the peer's own sender ID instead, so it returns `None`.
    pub fn recipient_channel_id(&self) -> Option<u32> {
        match self {
            Message::Open(_) => None,
            Message::OpenConfirmation(msg) => Some(msg.recipient_channel_id),
            Message::OpenFailure(msg) => Some(msg.recipient_channel_id),
            Message::WindowAdjust(msg) => Some(msg.recipient_channel_id),
            Message::Data(msg) => Some(msg.recipient_channel_id),
            Message::ExtendedData(msg) => Some(msg.recipient_channel_id),
            Message::Eof(msg) => Some(msg.recipient_channel_id),
            Message::Close(msg) => Some(msg.recipient_channel_id),
            Message::Request(msg) => Some(msg.recipient_channel_id),
            Message::Success(msg) => Some(msg.recipient_channel_id),
            Message::Failure(msg) => Some(msg.recipient_channel_id),
        }
    }
}

/// Reason code carried by `channelOpenFailure` (RFC 4254 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasonCode(pub u32);

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self.0 {
            0x01 => "ADMINISTRATIVELY_PROHIBITED",
            0x02 => "CONNECT_FAILED",
            0x03 => "UNKNOWN_CHANNEL_TYPE",
            0x04 => "RESOURCE_SHORTAGE",
            0x00 | 0x05.. => "OTHER",
        };
        write!(f, "{} ({})", desc, self.0)
    }
}

impl ReasonCode {
    /// Administratively prohibited (e.g. no handler is willing to accept the channel)
    pub const ADMINISTRATIVELY_PROHIBITED: Self = ReasonCode(0x01);

    /// The target of the channel could not be set up
    pub const CONNECT_FAILED: Self = ReasonCode(0x02);

    /// Channel type not recognized
    pub const UNKNOWN_CHANNEL_TYPE: Self = ReasonCode(0x03);

    /// Out of resources (e.g. no channel identifier left)
    pub const RESOURCE_SHORTAGE: Self = ReasonCode(0x04);
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Open = 90,
    OpenConfirmation = 91,
    OpenFailure = 92,
    WindowAdjust = 93,
    Data = 94,
    ExtendedData = 95,
    Eof = 96,
    Close = 97,
    Request = 98,
    Success = 99,
    Failure = 100,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(v: u8) -> Result<MessageType, Error> {
        match v {
            90 => Ok(MessageType::Open),
            91 => Ok(MessageType::OpenConfirmation),
            92 => Ok(MessageType::OpenFailure),
            93 => Ok(MessageType::WindowAdjust),
            94 => Ok(MessageType::Data),
            95 => Ok(MessageType::ExtendedData),
            96 => Ok(MessageType::Eof),
            97 => Ok(MessageType::Close),
            98 => Ok(MessageType::Request),
            99 => Ok(MessageType::Success),
            100 => Ok(MessageType::Failure),
            _ => Err(Error::InvalidPacket {
                name: "MESSAGE TYPE",
                field: "msgType",
                reason: "unknown value",
            }),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelOpen {
    pub sender_channel_id: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
    pub channel_type: ChannelType,
}

impl ChannelOpen {
    pub const NAME: &'static str = "CHANNEL OPEN";
    pub const FIXED_PART_SIZE: usize = 4 /* senderChannelId */ + 4 /* initialWindowSize */ + 4 /* maximumPacketSize */;

    pub fn new(id: LocalChannelId, initial_window_size: u32, maximum_packet_size: u32, channel_type: ChannelType) -> Self {
        Self {
            sender_channel_id: u32::from(id),
            initial_window_size,
            maximum_packet_size,
            channel_type,
        }
    }

    pub fn size(&self) -> usize {
        string_size(self.channel_type.name().as_bytes()) + Self::FIXED_PART_SIZE + self.channel_type.type_specific_size()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        put_string(buf, self.channel_type.name().as_bytes())?;
        buf.put_u32(self.sender_channel_id);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        self.channel_type.encode_type_specific(buf)
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        let type_name = get_utf8_string(&mut buf, Self::NAME, "channelType")?;

        ensure_size!(fixed Self in buf);
        let sender_channel_id = buf.get_u32();
        let initial_window_size = buf.get_u32();
        let maximum_packet_size = buf.get_u32();

        let channel_type = ChannelType::decode_type_specific(&type_name, &mut buf)?;

        Ok(Self {
            sender_channel_id,
            initial_window_size,
            maximum_packet_size,
            channel_type,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    pub recipient_channel_id: u32,
    pub sender_channel_id: u32,
    pub initial_window_size: u32,
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    pub const NAME: &'static str = "CHANNEL OPEN CONFIRMATION";
    pub const SIZE: usize =
        4 /*recipientChannelId*/ + 4 /*senderChannelId*/ + 4 /*initialWindowSize*/ + 4 /*maximumPacketSize*/;

    pub fn new(
        distant_id: DistantChannelId,
        local_id: LocalChannelId,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel_id: u32::from(distant_id),
            sender_channel_id: u32::from(local_id),
            initial_window_size,
            maximum_packet_size,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel_id);
        buf.put_u32(self.sender_channel_id);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);
        Ok(Self {
            recipient_channel_id: buf.get_u32(),
            sender_channel_id: buf.get_u32(),
            initial_window_size: buf.get_u32(),
            maximum_packet_size: buf.get_u32(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    pub recipient_channel_id: u32,
    pub reason_code: ReasonCode,
    pub description: String,
    pub language_tag: String,
}

impl ChannelOpenFailure {
    pub const NAME: &'static str = "CHANNEL OPEN FAILURE";
    pub const FIXED_PART_SIZE: usize = 4 /*recipientChannelId*/ + 4 /*reasonCode*/;

    pub fn new(distant_id: DistantChannelId, reason_code: ReasonCode, description: impl Into<String>) -> Self {
        Self {
            recipient_channel_id: u32::from(distant_id),
            reason_code,
            description: description.into(),
            language_tag: String::new(),
        }
    }

    pub fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + string_size(self.description.as_bytes()) + string_size(self.language_tag.as_bytes())
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u32(self.recipient_channel_id);
        buf.put_u32(self.reason_code.0);
        put_string(buf, self.description.as_bytes())?;
        put_string(buf, self.language_tag.as_bytes())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(fixed Self in buf);
        let recipient_channel_id = buf.get_u32();
        let reason_code = ReasonCode(buf.get_u32());
        let description = get_utf8_string(&mut buf, Self::NAME, "description")?.to_string();
        let language_tag = get_utf8_string(&mut buf, Self::NAME, "languageTag")?.to_string();

        Ok(Self {
            recipient_channel_id,
            reason_code,
            description,
            language_tag,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    pub recipient_channel_id: u32,
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    pub const NAME: &'static str = "CHANNEL WINDOW ADJUST";
    pub const SIZE: usize = 4 /*recipientChannelId*/ + 4 /*bytesToAdd*/;

    pub fn new(distant_id: DistantChannelId, bytes_to_add: u32) -> Self {
        ChannelWindowAdjust {
            recipient_channel_id: u32::from(distant_id),
            bytes_to_add,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel_id);
        buf.put_u32(self.bytes_to_add);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);
        Ok(Self {
            recipient_channel_id: buf.get_u32(),
            bytes_to_add: buf.get_u32(),
        })
    }
}

#[derive(PartialEq, Eq)]
pub struct ChannelData {
    pub recipient_channel_id: u32,
    pub transfer_data: Bytes,
}

// We don't want to print `transfer_data` content (usually too big)
impl fmt::Debug for ChannelData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelData")
            .field("recipient_channel_id", &self.recipient_channel_id)
            .field("transfer_data.len()", &self.transfer_data.len())
            .finish_non_exhaustive()
    }
}

impl ChannelData {
    pub const NAME: &'static str = "CHANNEL DATA";
    pub const FIXED_PART_SIZE: usize = 4 /*recipientChannelId*/;

    pub fn new(id: DistantChannelId, data: Bytes) -> Self {
        ChannelData {
            recipient_channel_id: u32::from(id),
            transfer_data: data,
        }
    }

    pub fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + string_size(&self.transfer_data)
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u32(self.recipient_channel_id);
        put_string(buf, &self.transfer_data)
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(fixed Self in buf);
        let recipient_channel_id = buf.get_u32();
        let transfer_data = get_string(&mut buf, Self::NAME, "data")?;
        Ok(Self {
            recipient_channel_id,
            transfer_data,
        })
    }
}

#[derive(PartialEq, Eq)]
pub struct ChannelExtendedData {
    pub recipient_channel_id: u32,
    pub data_type_code: u32,
    pub transfer_data: Bytes,
}

impl fmt::Debug for ChannelExtendedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelExtendedData")
            .field("recipient_channel_id", &self.recipient_channel_id)
            .field("data_type_code", &self.data_type_code)
            .field("transfer_data.len()", &self.transfer_data.len())
            .finish_non_exhaustive()
    }
}

impl ChannelExtendedData {
    pub const NAME: &'static str = "CHANNEL EXTENDED DATA";
    pub const FIXED_PART_SIZE: usize = 4 /*recipientChannelId*/ + 4 /*dataTypeCode*/;

    pub fn new(id: DistantChannelId, data_type_code: u32, data: Bytes) -> Self {
        ChannelExtendedData {
            recipient_channel_id: u32::from(id),
            data_type_code,
            transfer_data: data,
        }
    }

    pub fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + string_size(&self.transfer_data)
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u32(self.recipient_channel_id);
        buf.put_u32(self.data_type_code);
        put_string(buf, &self.transfer_data)
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(fixed Self in buf);
        let recipient_channel_id = buf.get_u32();
        let data_type_code = buf.get_u32();
        let transfer_data = get_string(&mut buf, Self::NAME, "data")?;
        Ok(Self {
            recipient_channel_id,
            data_type_code,
            transfer_data,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelEof {
    pub recipient_channel_id: u32,
}

impl ChannelEof {
    pub const NAME: &'static str = "CHANNEL EOF";
    pub const SIZE: usize = 4 /*recipientChannelId*/;

    pub fn new(distant_id: DistantChannelId) -> Self {
        Self {
            recipient_channel_id: u32::from(distant_id),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel_id);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);
        Ok(Self {
            recipient_channel_id: buf.get_u32(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelClose {
    pub recipient_channel_id: u32,
}

impl ChannelClose {
    pub const NAME: &'static str = "CHANNEL CLOSE";
    pub const SIZE: usize = 4 /*recipientChannelId*/;

    pub fn new(distant_id: DistantChannelId) -> Self {
        Self {
            recipient_channel_id: u32::from(distant_id),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel_id);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);
        Ok(Self {
            recipient_channel_id: buf.get_u32(),
        })
    }
}

/// Channel request, with the type-specific part kept opaque.
///
/// The multiplexer routes requests unchanged; interpreting `type_specific`
/// belongs to the layer above the child channel.
#[derive(Debug, PartialEq, Eq)]
pub struct ChannelRequest {
    pub recipient_channel_id: u32,
    pub request_type: SmolStr,
    pub want_reply: bool,
    pub type_specific: Bytes,
}

impl ChannelRequest {
    pub const NAME: &'static str = "CHANNEL REQUEST";
    pub const FIXED_PART_SIZE: usize = 4 /*recipientChannelId*/;

    pub fn new(
        distant_id: DistantChannelId,
        request_type: impl Into<SmolStr>,
        want_reply: bool,
        type_specific: Bytes,
    ) -> Self {
        Self {
            recipient_channel_id: u32::from(distant_id),
            request_type: request_type.into(),
            want_reply,
            type_specific,
        }
    }

    pub fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + string_size(self.request_type.as_bytes()) + 1 /*wantReply*/ + self.type_specific.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u32(self.recipient_channel_id);
        put_string(buf, self.request_type.as_bytes())?;
        buf.put_u8(u8::from(self.want_reply));
        buf.put(self.type_specific.slice(..));
        Ok(())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(fixed Self in buf);
        let recipient_channel_id = buf.get_u32();
        let request_type = get_utf8_string(&mut buf, Self::NAME, "requestType")?;
        ensure_size!(buf[1] for Self::NAME);
        let want_reply = buf.get_u8() != 0;

        Ok(Self {
            recipient_channel_id,
            request_type,
            want_reply,
            type_specific: buf,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelSuccess {
    pub recipient_channel_id: u32,
}

impl ChannelSuccess {
    pub const NAME: &'static str = "CHANNEL SUCCESS";
    pub const SIZE: usize = 4 /*recipientChannelId*/;

    pub fn new(distant_id: DistantChannelId) -> Self {
        Self {
            recipient_channel_id: u32::from(distant_id),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel_id);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);
        Ok(Self {
            recipient_channel_id: buf.get_u32(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ChannelFailure {
    pub recipient_channel_id: u32,
}

impl ChannelFailure {
    pub const NAME: &'static str = "CHANNEL FAILURE";
    pub const SIZE: usize = 4 /*recipientChannelId*/;

    pub fn new(distant_id: DistantChannelId) -> Self {
        Self {
            recipient_channel_id: u32::from(distant_id),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.recipient_channel_id);
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);
        Ok(Self {
            recipient_channel_id: buf.get_u32(),
        })
    }
}
