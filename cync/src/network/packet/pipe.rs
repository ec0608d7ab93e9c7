//! pipe 报文：通用的命令/响应信封
//!
//! ```text
//! 0-3    relay 地址
//! 4-5    序列号
//! 6      0x00
//! 7-8    0x7e00
//! 9-12   0x01 0x00 0x00 0xf8
//! 13     子类型
//! 14     参数长度 N
//! 15..   参数
//! 末尾   0x00 0x00 0x00
//! ```
//! 信封中的固定字节含义未知，只能原样保留

use bytes::{BufMut, BytesMut};

use super::{Packet, PacketType};

pub const SET_STATUS: u8 = 0xd0;
pub const SET_LUM: u8 = 0xd2;
/// 色温与 RGB 共用同一个子类型，由参数首字节区分
pub const SET_CT: u8 = 0xe2;
pub const GET_STATUS: u8 = 0xdb;
pub const GET_STATUS_PAGINATED: u8 = 0x52;

/// 子类型所在偏移
pub const SUBTYPE_OFFSET: usize = 13;
/// 信封头长度（到参数长度字节为止）
pub const ENVELOPE_LEN: usize = 15;

const ENVELOPE_MARKER: u16 = 0x7e00;
const ENVELOPE_FIXED: [u8; 4] = [0x01, 0x00, 0x00, 0xf8];
const ENVELOPE_TRAILER: [u8; 3] = [0x00, 0x00, 0x00];

const CT_MODE_TONE: u8 = 0x05;
const CT_MODE_RGB: u8 = 0x04;

const STATUS_QUERY: [u8; 6] = [0x00, 0x00, 0x00, 0xff, 0xff, 0x00];

/// 构建指定子类型的 pipe 报文
pub fn pipe(relay: u32, seq: u16, subtype: u8, data: &[u8]) -> Packet {
    assert!(data.len() <= 0xff, "pipe payload is too long");

    let mut stream =
        BytesMut::with_capacity(ENVELOPE_LEN + data.len() + ENVELOPE_TRAILER.len());
    stream.put_u32(relay);
    stream.put_u16(seq);
    stream.put_u8(0);
    stream.put_u16(ENVELOPE_MARKER);
    stream.put_slice(&ENVELOPE_FIXED);
    stream.put_u8(subtype);
    stream.put_u8(data.len() as u8);
    stream.put_slice(data);
    stream.put_slice(&ENVELOPE_TRAILER);

    Packet::new(PacketType::Pipe, stream.freeze())
}

/// 针对某个设备的命令参数：设备索引 + 重复一次的子类型 + 命令参数
fn command(subtype: u8, device_index: u16, params: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(11 + params.len());
    data.extend_from_slice(&[0, 0, 0, 0, 0]);
    data.extend_from_slice(&device_index.to_be_bytes());
    data.extend_from_slice(&[0, subtype, 0, 0]);
    data.extend_from_slice(params);
    data
}

/// 开关灯
pub fn set_on_off(relay: u32, seq: u16, device_index: u16, on: bool) -> Packet {
    let data = command(SET_STATUS, device_index, &[on as u8, 0]);
    pipe(relay, seq, SET_STATUS, &data)
}

/// 设置亮度，取值 [1, 100]
pub fn set_brightness(relay: u32, seq: u16, device_index: u16, brightness: u8) -> Packet {
    assert!(
        (1..=100).contains(&brightness),
        "invalid brightness value: {}",
        brightness
    );
    let data = command(SET_LUM, device_index, &[brightness]);
    pipe(relay, seq, SET_LUM, &data)
}

/// 设置色温，取值 [0, 100]，0 偏橙，100 偏蓝
pub fn set_color_tone(relay: u32, seq: u16, device_index: u16, tone: u8) -> Packet {
    assert!(tone <= 100, "invalid color tone value: {}", tone);
    let data = command(SET_CT, device_index, &[CT_MODE_TONE, tone]);
    pipe(relay, seq, SET_CT, &data)
}

pub fn set_rgb(relay: u32, seq: u16, device_index: u16, r: u8, g: u8, b: u8) -> Packet {
    let data = command(SET_CT, device_index, &[CT_MODE_RGB, r, g, b]);
    pipe(relay, seq, SET_CT, &data)
}

/// 查询 relay 下所有设备的状态
pub fn get_paginated_status(relay: u32, seq: u16) -> Packet {
    pipe(relay, seq, GET_STATUS_PAGINATED, &STATUS_QUERY)
}

pub fn subtype(packet: &Packet) -> Option<u8> {
    if packet.packet_type != PacketType::Pipe || packet.payload.len() < ENVELOPE_LEN {
        return None;
    }
    Some(packet.payload[SUBTYPE_OFFSET])
}

/// 同步报文：状态变更生效后，relay 主动推送的非响应 pipe 报文
///
/// 这是经验规则，可能收到之前请求遗留的报文，也可能根本不来
pub fn is_sync_marker(packet: &Packet, relay: u32) -> bool {
    !packet.is_response && packet.address() == Some(relay)
}
