//! 认证报文
//!
//! 请求负载：`0x03` + 账号 id（大端 u32）+ 令牌长度（大端 u16）+ 令牌 + `0x00 0x00 0xb4`

use bytes::{BufMut, BytesMut};

use super::{Error, Packet, PacketType};

const AUTH_HEADER: u8 = 0x03;
const AUTH_TRAILER: [u8; 3] = [0x00, 0x00, 0xb4];

/// 认证成功时服务端响应的负载
pub const AUTH_SUCCESS: [u8; 2] = [0x00, 0x00];

pub fn auth(user_id: u32, authorize: &str) -> Result<Packet, Error> {
    let token = authorize.as_bytes();
    let token_len = u16::try_from(token.len()).map_err(|_| Error::PacketTooLarge(token.len()))?;

    let mut stream = BytesMut::with_capacity(1 + 4 + 2 + token.len() + AUTH_TRAILER.len());
    stream.put_u8(AUTH_HEADER);
    stream.put_u32(user_id);
    stream.put_u16(token_len);
    stream.put_slice(token);
    stream.put_slice(&AUTH_TRAILER);

    Ok(Packet::new(PacketType::Auth, stream.freeze()))
}
