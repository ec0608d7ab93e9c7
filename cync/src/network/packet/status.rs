//! 分页状态响应
//!
//! 一个 relay 的响应中可以包含它所服务的多个设备的状态记录，每条记录 24 字节

use super::{pipe, Error, Packet, PacketType};

/// 单条状态记录的长度
pub const RECORD_LEN: usize = 24;
/// 记录区之前的头部长度
const RECORDS_HEADER_LEN: usize = 6;

const INDEX_OFFSET: usize = 1;
const ON_OFF_OFFSET: usize = 9;
const BRIGHTNESS_OFFSET: usize = 13;
const TONE_OFFSET: usize = 17;
const RGB_OFFSET: usize = 21;

/// 色温字节为该值时，设备处于 RGB 模式
const TONE_RGB_MODE: u8 = 0xfe;

/// 设备状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// relay 内的设备索引
    pub device_index: u16,
    pub is_on: bool,
    /// [0, 100]
    pub brightness: u8,
    /// [0, 100]，RGB 模式下为 0
    pub color_tone: u8,
    pub uses_rgb: bool,
    pub rgb: [u8; 3],
}

impl StatusReport {
    fn read(record: &[u8]) -> Self {
        let tone = record[TONE_OFFSET];
        let uses_rgb = tone == TONE_RGB_MODE;
        StatusReport {
            device_index: record[INDEX_OFFSET] as u16,
            is_on: record[ON_OFF_OFFSET] != 0,
            brightness: record[BRIGHTNESS_OFFSET],
            color_tone: if uses_rgb { 0 } else { tone },
            uses_rgb,
            rgb: [
                record[RGB_OFFSET],
                record[RGB_OFFSET + 1],
                record[RGB_OFFSET + 2],
            ],
        }
    }
}

pub fn is_paginated_status_response(packet: &Packet) -> bool {
    packet.packet_type == PacketType::Pipe
        && packet.payload.len() >= pipe::ENVELOPE_LEN
        && packet.payload[pipe::SUBTYPE_OFFSET] == pipe::GET_STATUS_PAGINATED
}

/// 按输入顺序解码所有状态记录
pub fn decode_paginated_status(packet: &Packet) -> Result<Vec<StatusReport>, Error> {
    if !is_paginated_status_response(packet) {
        return Err(Error::NotStatusResponse);
    }

    let length = packet.payload[pipe::ENVELOPE_LEN - 1] as usize;
    let data = &packet.payload[pipe::ENVELOPE_LEN..];
    if length > data.len() || length < RECORDS_HEADER_LEN {
        return Err(Error::MalformedStatus);
    }

    let records = &data[RECORDS_HEADER_LEN..length];
    if records.len() % RECORD_LEN != 0 {
        return Err(Error::MalformedStatus);
    }

    Ok(records.chunks_exact(RECORD_LEN).map(StatusReport::read).collect())
}

/// 按服务端格式编码状态响应，供测试模拟 relay 使用
#[cfg(test)]
pub(crate) fn encode_paginated_status(relay: u32, reports: &[StatusReport]) -> Packet {
    use bytes::{BufMut, BytesMut};

    let mut stream = BytesMut::new();
    stream.put_u32(relay);
    stream.put_u16(0);
    stream.put_slice(&[0x00, 0x7e, 0x00, 0x01, 0x00, 0x00, 0xf8]);
    stream.put_u8(pipe::GET_STATUS_PAGINATED);
    stream.put_u8((RECORDS_HEADER_LEN + reports.len() * RECORD_LEN) as u8);
    stream.put_slice(&[0; RECORDS_HEADER_LEN]);
    for report in reports {
        let mut record = [0u8; RECORD_LEN];
        record[INDEX_OFFSET] = report.device_index as u8;
        record[ON_OFF_OFFSET] = report.is_on as u8;
        record[BRIGHTNESS_OFFSET] = report.brightness;
        record[TONE_OFFSET] = if report.uses_rgb {
            TONE_RGB_MODE
        } else {
            report.color_tone
        };
        record[RGB_OFFSET..].copy_from_slice(&report.rgb);
        stream.put_slice(&record);
    }
    stream.put_slice(&[0, 0, 0]);

    Packet::response(PacketType::Pipe, stream.freeze())
}
