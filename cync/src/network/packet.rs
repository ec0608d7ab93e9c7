//! 报文编解码
//!
//! 报文格式：
//! * 第 1 字节：高 4 位为报文类型，低 3 位固定为 `0b011`，第 4 位标识是否为响应
//! * 第 2-5 字节：负载长度，大端 u32
//! * 之后为负载

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod auth;
pub mod pipe;
pub mod status;

pub use status::StatusReport;

/// 报文头长度
pub const HEADER_LEN: usize = 5;
/// 负载最大长度，超过的报文视为损坏或恶意数据
pub const PAYLOAD_MAX_LENGTH: usize = 0x10_0000;

const TYPE_FLAGS: u8 = 0b011;
const RESPONSE_FLAG: u8 = 0b1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("At least {0} more bytes required")]
    InsufficientBytes(usize),
    #[error("Packet is unreasonably large: {0} bytes")]
    PacketTooLarge(usize),
    #[error("Malformed paginated status response")]
    MalformedStatus,
    #[error("Packet is not a paginated status response")]
    NotStatusResponse,
}

/// 报文类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Auth,
    Pipe,
    /// 服务端还会推送一些未解析的报文类型，原样保留
    Unknown(u8),
}

impl PacketType {
    #[inline]
    fn as_u8(self) -> u8 {
        match self {
            PacketType::Auth => 1,
            PacketType::Pipe => 7,
            PacketType::Unknown(kind) => kind & 0x0f,
        }
    }
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            1 => PacketType::Auth,
            7 => PacketType::Pipe,
            kind => PacketType::Unknown(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 报文类型
    pub packet_type: PacketType,
    /// 是否为服务端的响应
    pub is_response: bool,
    /// 负载
    pub payload: Bytes,
}

impl Packet {
    /// 请求报文
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            is_response: false,
            payload: payload.into(),
        }
    }

    /// 响应报文
    pub fn response(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            is_response: true,
            payload: payload.into(),
        }
    }

    /// 编码后的总长度
    #[inline]
    pub fn len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// 从缓冲区读取一个完整报文
    ///
    /// 数据不足时返回 `InsufficientBytes`，缓冲区保持不变；
    /// 声明长度超限时直接返回错误，不会等待读取负载
    pub fn read(stream: &mut BytesMut) -> Result<Self, Error> {
        if stream.len() < HEADER_LEN {
            return Err(Error::InsufficientBytes(HEADER_LEN - stream.len()));
        }

        let type_byte = stream[0];
        let payload_len = u32::from_be_bytes([stream[1], stream[2], stream[3], stream[4]]) as usize;
        if payload_len > PAYLOAD_MAX_LENGTH {
            return Err(Error::PacketTooLarge(payload_len));
        }

        let packet_len = HEADER_LEN + payload_len;
        if stream.len() < packet_len {
            return Err(Error::InsufficientBytes(packet_len - stream.len()));
        }

        // split_to 会同时推进缓冲区
        let mut frame = stream.split_to(packet_len).freeze();
        frame.advance(HEADER_LEN);

        Ok(Packet {
            packet_type: PacketType::from(type_byte >> 4),
            is_response: type_byte & RESPONSE_FLAG != 0,
            payload: frame,
        })
    }

    pub fn write(&self, stream: &mut BytesMut) -> Result<(), Error> {
        if self.payload.len() > PAYLOAD_MAX_LENGTH {
            return Err(Error::PacketTooLarge(self.payload.len()));
        }

        let mut type_byte = (self.packet_type.as_u8() << 4) | TYPE_FLAGS;
        if self.is_response {
            type_byte |= RESPONSE_FLAG;
        }

        stream.reserve(self.len());
        stream.put_u8(type_byte);
        stream.put_u32(self.payload.len() as u32);
        stream.extend_from_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, Error> {
        let mut stream = BytesMut::with_capacity(self.len());
        self.write(&mut stream)?;
        Ok(stream.freeze())
    }

    /// pipe 负载前 4 字节为 relay 地址
    pub fn address(&self) -> Option<u32> {
        if self.packet_type != PacketType::Pipe || self.payload.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// pipe 负载第 5-6 字节为序列号
    pub fn sequence(&self) -> Option<u16> {
        if self.packet_type != PacketType::Pipe || self.payload.len() < 6 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[4], self.payload[5]]))
    }

    /// 远端在响应负载的最后一个字节给出非零状态，表示调用失败
    pub fn is_nack(&self) -> bool {
        self.is_response && matches!(self.payload.last(), Some(&status) if status != 0)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet(type={}, response={}, data=[",
            self.packet_type.as_u8(),
            self.is_response
        )?;
        for (i, byte) in self.payload.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        f.write_str("])")
    }
}
