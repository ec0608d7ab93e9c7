//! 与服务端之间的连接
//! 单纯的 tcp 读写管理，以 packet 为单位读写，外加一次性的认证交换

use std::time::Duration;

use bytes::BytesMut;
use log::debug;
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    time,
};

use super::packet::{self, auth, Packet, PacketType};

/// 每次从 socket 读取时至少预留的缓冲区大小
const READ_CHUNK: usize = 4 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Packet error: {0}")]
    Packet(#[from] packet::Error),
    #[error("I/O: {0}")]
    IO(#[from] io::Error),
    #[error("Connect timeout")]
    ConnectTimeout,
    #[error("Connection closed by peer")]
    ConnectionAborted,
    #[error("Authentication timeout")]
    AuthTimeout,
    #[error("Credentials not recognized")]
    AuthRejected,
    #[error("Unexpected response packet: {0:?}")]
    UnexpectedPacket(PacketType),
}

/// 一条到服务端的物理连接
pub struct Connection<S> {
    stream: S,
    /// 读缓冲区
    read: BytesMut,
    /// 写缓冲区，先写入缓冲区再一次性刷入 socket
    write: BytesMut,
    closed: bool,
}

impl Connection<TcpStream> {
    /// 在限定时间内建立 tcp 连接
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, Error> {
        let stream = time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        debug!("connected to {}", addr);
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read: BytesMut::new(),
            write: BytesMut::new(),
            closed: false,
        }
    }

    /// 读取一个 packet
    pub async fn read_packet(&mut self) -> Result<Packet, Error> {
        read_packet(&mut self.stream, &mut self.read).await
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        write_packet(&mut self.stream, &mut self.write, packet).await
    }

    /// 认证交换
    ///
    /// 整个交换在 `timeout` 内完成，超时只作用于本次交换，不影响后续读写
    pub async fn authenticate(
        &mut self,
        user_id: u32,
        authorize: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        match time::timeout(timeout, self.auth_exchange(user_id, authorize)).await {
            Ok(res) => res,
            Err(_) => Err(Error::AuthTimeout),
        }
    }

    async fn auth_exchange(&mut self, user_id: u32, authorize: &str) -> Result<(), Error> {
        self.write_packet(&auth::auth(user_id, authorize)?).await?;

        let response = self.read_packet().await?;
        if response.packet_type != PacketType::Auth || !response.is_response {
            return Err(Error::UnexpectedPacket(response.packet_type));
        }
        if response.payload[..] != auth::AUTH_SUCCESS {
            return Err(Error::AuthRejected);
        }
        Ok(())
    }

    /// 关闭连接，可重复调用
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown().await {
            debug!("shutdown connection error: {}", e)
        }
    }

    /// 拆分为读写两半，读缓冲区中已有的数据交给读端
    pub fn into_split(self) -> (PacketReader<ReadHalf<S>>, PacketWriter<WriteHalf<S>>) {
        let (read_half, write_half) = io::split(self.stream);
        (
            PacketReader {
                stream: read_half,
                read: self.read,
            },
            PacketWriter {
                stream: write_half,
                write: self.write,
                closed: self.closed,
            },
        )
    }
}

/// 连接的读端，交给后台读任务
pub struct PacketReader<R> {
    stream: R,
    read: BytesMut,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub async fn read_packet(&mut self) -> Result<Packet, Error> {
        read_packet(&mut self.stream, &mut self.read).await
    }
}

/// 连接的写端
pub struct PacketWriter<W> {
    stream: W,
    write: BytesMut,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        write_packet(&mut self.stream, &mut self.write, packet).await
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown().await {
            debug!("shutdown connection error: {}", e)
        }
    }
}

/// 缓冲区数据不足一个报文时，从 socket 读取更多数据
/// 报文未读完时连接关闭，视为连接错误
async fn read_packet<R>(stream: &mut R, read: &mut BytesMut) -> Result<Packet, Error>
where
    R: AsyncRead + Unpin,
{
    loop {
        let required = match Packet::read(read) {
            Ok(packet) => return Ok(packet),
            Err(packet::Error::InsufficientBytes(n)) => n,
            Err(e) => return Err(Error::Packet(e)),
        };

        read.reserve(required.max(READ_CHUNK));
        if stream.read_buf(read).await? == 0 {
            return Err(Error::ConnectionAborted);
        }
    }
}

async fn write_packet<W>(stream: &mut W, write: &mut BytesMut, packet: &Packet) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    packet.write(write)?;
    // write_all 内部处理部分写入
    let res = stream.write_all(&write[..]).await;
    write.clear();
    res?;
    stream.flush().await?;
    Ok(())
}
