//! 会话引擎
//!
//! 每次调用都新建一条短连接：认证，写入请求报文，由后台任务逐个读取入站报文，
//! 交给调用方提供的匹配函数，直到匹配函数给出结果或者超时。
//! 服务端在新连接认证时会踢掉旧连接，因此同一时间只允许一个会话。

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};

use crate::{
    account::SessionCredentials,
    config,
    device::{DeviceId, DeviceStatus, LogicalDevice},
    error::{Error, Result},
    network::{
        conn::{PacketReader, PacketWriter},
        packet::{pipe, status, Packet, PacketType, StatusReport},
        Dialer, TcpDialer,
    },
    routing::RoutingTable,
    Account,
};

/// 默认调用超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// 批量开关时每个设备最多使用的 relay 数
pub const DEFAULT_BLAST_RELAYS: usize = 3;

/// 后台读任务与调用方之间的队列长度
const PACKET_QUEUE_SIZE: usize = 16;

/// 进程内所有 Controller 共享，同一时间只允许一个已认证的会话
static SESSION: Mutex<()> = Mutex::const_new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// 等待确认报文，以及之后表示状态已生效的同步报文
    #[default]
    Sync,
    /// 只等待确认报文
    Async,
}

/// 匹配函数对每个入站报文的判定
#[derive(Debug)]
pub enum Step {
    Continue,
    Done,
    Fail(Error),
}

pub struct Controller<A, D = TcpDialer> {
    account: Arc<A>,
    dialer: D,
    timeout: Duration,
    credentials: RwLock<Arc<SessionCredentials>>,
    routing: RoutingTable,
    /// 最近一次枚举得到的设备
    devices: RwLock<Vec<Arc<LogicalDevice>>>,
    seq: AtomicU16,
    /// 默认为进程级的 [`SESSION`]
    session: &'static Mutex<()>,
}

impl<A: Account> Controller<A> {
    pub fn new(cfg: &config::Server, account: Arc<A>, credentials: SessionCredentials) -> Self {
        let dialer = TcpDialer::new(cfg.addr.clone(), cfg.connect_timeout());
        Self::with_dialer(dialer, account, credentials, cfg.call_timeout())
    }

    /// 通过账号服务登录后创建
    pub async fn login(cfg: &config::Server, account: Arc<A>) -> Result<Self> {
        let credentials = account.login().await?;
        Ok(Self::new(cfg, account, credentials))
    }
}

impl<A: Account, D: Dialer> Controller<A, D> {
    /// `timeout` 为 0 时使用 [`DEFAULT_TIMEOUT`]
    pub fn with_dialer(
        dialer: D,
        account: Arc<A>,
        credentials: SessionCredentials,
        timeout: Duration,
    ) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        Self {
            account,
            dialer,
            timeout,
            credentials: RwLock::new(Arc::new(credentials)),
            routing: RoutingTable::new(),
            devices: RwLock::new(Vec::new()),
            seq: AtomicU16::new(0),
            session: &SESSION,
        }
    }

    /// 使用独立的会话锁，测试之间互不阻塞
    #[cfg(test)]
    pub(crate) fn with_session_lock(mut self, session: &'static Mutex<()>) -> Self {
        self.session = session;
        self
    }

    pub fn credentials(&self) -> Arc<SessionCredentials> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 重新登录，整体替换会话凭证
    pub async fn relogin(&self) -> Result<()> {
        let credentials = self.account.login().await?;
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(credentials);
        info!("session credentials refreshed");
        Ok(())
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn devices(&self) -> Vec<Arc<LogicalDevice>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn find_device(&self, id: DeviceId) -> Option<Arc<LogicalDevice>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|device| device.id() == id)
            .cloned()
    }

    /// 枚举账号下的设备，并立即批量查询一次状态
    ///
    /// 查询失败的设备标记为离线，不影响整体结果
    pub async fn enumerate_devices(&self) -> Result<Vec<Arc<LogicalDevice>>> {
        let credentials = self.credentials();
        let descriptors = self.account.devices(&credentials).await?;

        let previous = self.devices();
        let devices: Vec<Arc<LogicalDevice>> = descriptors
            .into_iter()
            .map(|descriptor| {
                // 身份不变的设备沿用原来的对象，调用方持有的句柄继续有效
                previous
                    .iter()
                    .find(|d| d.id() == descriptor.id && d.home_relay() == descriptor.switch_id)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(LogicalDevice::from(descriptor)))
            })
            .collect();

        let statuses = self.query_status_batch(&devices).await;
        for (device, res) in devices.iter().zip(statuses) {
            if let Err(e) = res {
                device.set_status(DeviceStatus::default());
                debug!("device {} is offline: {}", device.id(), e);
            }
        }

        for old in previous.iter() {
            if !devices.iter().any(|d| d.id() == old.id()) {
                self.routing.forget(old.id());
            }
        }
        *self.devices.write().unwrap_or_else(PoisonError::into_inner) = devices.clone();
        info!("enumerated {} device(s)", devices.len());
        Ok(devices)
    }

    /// 查询单个设备状态
    ///
    /// 向设备所有已知 relay 同时发送查询：设备自身 relay 的响应直接采用；
    /// 否则优先采用当前选中的 relay 的响应
    pub async fn query_status(&self, device: &LogicalDevice) -> Result<DeviceStatus> {
        match self.lookup_status(device).await {
            Ok((relay, report)) => {
                self.routing
                    .record_success(device.id(), relay, device.is_own_relay(relay));
                let status = DeviceStatus::online(report);
                device.set_status(status);
                Ok(status)
            }
            Err(e) => {
                self.failover(device.id());
                Err(e.context("query status", device.id()))
            }
        }
    }

    async fn lookup_status(&self, device: &LogicalDevice) -> Result<(u32, StatusReport)> {
        let relays = self.routing.relays(device.id());
        let current = *relays.first().ok_or(Error::Unreachable)?;
        let packets = relays
            .iter()
            .map(|&relay| pipe::get_paginated_status(relay, self.next_seq()))
            .collect();

        let mut pending: HashSet<u32> = relays.iter().copied().collect();
        let mut best: Option<(u32, StatusReport)> = None;
        let mut failure: Option<Error> = None;
        let res = self
            .call_and_wait(packets, false, |packet| {
                // 每个 relay 只采用第一个响应
                let relay = match packet.address() {
                    Some(relay) if pending.contains(&relay) => relay,
                    _ => return Step::Continue,
                };

                if packet.is_nack() {
                    pending.remove(&relay);
                    failure = Some(Error::RemoteCall);
                } else if status::is_paginated_status_response(packet) {
                    pending.remove(&relay);
                    match status::decode_paginated_status(packet) {
                        Ok(reports) => {
                            let found = reports
                                .into_iter()
                                .find(|report| report.device_index == device.index());
                            if let Some(report) = found {
                                if device.is_own_relay(relay) {
                                    best = Some((relay, report));
                                    return Step::Done;
                                }
                                if best.is_none() || relay == current {
                                    best = Some((relay, report));
                                }
                            }
                        }
                        Err(e) => failure = Some(e.into()),
                    }
                } else {
                    return Step::Continue;
                }

                let own_pending = pending.iter().any(|&r| device.is_own_relay(r));
                let current_found = matches!(best, Some((r, _)) if r == current);
                if pending.is_empty() || (current_found && !own_pending) {
                    Step::Done
                } else {
                    Step::Continue
                }
            })
            .await;

        match best {
            Some(found) => {
                if let Err(e) = res {
                    debug!("status of {} resolved before: {}", device.id(), e);
                }
                Ok(found)
            }
            None => {
                res?;
                Err(failure.unwrap_or(Error::MissingStatus))
            }
        }
    }

    /// 批量查询设备状态，每个设备单独给出结果
    ///
    /// 每个设备只向其主 relay 发送查询，共享 relay 的设备由同一个响应解析
    pub async fn query_status_batch(
        &self,
        devices: &[Arc<LogicalDevice>],
    ) -> Vec<Result<DeviceStatus>> {
        if devices.is_empty() {
            return Vec::new();
        }

        // 路由表还没有记录时，使用目录中设备自身的 relay
        let targets: Vec<u32> = devices
            .iter()
            .map(|d| {
                self.routing
                    .current_relay(d.id())
                    .unwrap_or_else(|_| d.home_relay())
            })
            .collect();

        // relay 服务的家庭，只有同一家庭的记录才归属到设备
        let mut relays = Vec::new();
        let mut meshes: HashMap<u32, HashSet<u64>> = HashMap::new();
        for (device, &relay) in devices.iter().zip(targets.iter()) {
            meshes
                .entry(relay)
                .or_insert_with(|| {
                    relays.push(relay);
                    HashSet::new()
                })
                .insert(device.mesh());
        }

        let packets = relays
            .iter()
            .enumerate()
            .map(|(i, &relay)| pipe::get_paginated_status(relay, i as u16))
            .collect();

        let mut pending: HashSet<u32> = relays.iter().copied().collect();
        let mut found: Vec<Option<Result<(u32, StatusReport)>>> =
            devices.iter().map(|_| None).collect();
        let res = self
            .call_and_wait(packets, false, |packet| {
                let relay = match packet.address() {
                    Some(relay) if pending.contains(&relay) => relay,
                    _ => return Step::Continue,
                };

                if packet.is_nack() {
                    pending.remove(&relay);
                    for (slot, &target) in found.iter_mut().zip(targets.iter()) {
                        if slot.is_none() && target == relay {
                            *slot = Some(Err(Error::RemoteCall));
                        }
                    }
                } else if status::is_paginated_status_response(packet) {
                    pending.remove(&relay);
                    match status::decode_paginated_status(packet) {
                        Ok(reports) => {
                            let served = &meshes[&relay];
                            for report in reports {
                                for (device, slot) in devices.iter().zip(found.iter_mut()) {
                                    if slot.is_none()
                                        && served.contains(&device.mesh())
                                        && device.index() == report.device_index
                                    {
                                        *slot = Some(Ok((relay, report)));
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            for (slot, &target) in found.iter_mut().zip(targets.iter()) {
                                if slot.is_none() && target == relay {
                                    *slot = Some(Err(e.clone().into()));
                                }
                            }
                        }
                    }
                } else {
                    return Step::Continue;
                }

                if pending.is_empty() {
                    Step::Done
                } else {
                    Step::Continue
                }
            })
            .await;

        let shared = res.err().map(Arc::new);
        devices
            .iter()
            .zip(targets)
            .zip(found)
            .map(|((device, target), slot)| {
                let res = match slot {
                    Some(res) => res,
                    None => match &shared {
                        Some(e) if pending.contains(&target) => Err(Error::Shared(e.clone())),
                        _ => Err(Error::MissingStatus),
                    },
                };
                match res {
                    Ok((relay, report)) => {
                        self.routing
                            .record_success(device.id(), relay, device.is_own_relay(relay));
                        let status = DeviceStatus::online(report);
                        device.set_status(status);
                        Ok(status)
                    }
                    Err(e) => {
                        debug!("query status of {} failed: {}", device.id(), e);
                        self.failover(device.id());
                        Err(e.context("query status", device.id()))
                    }
                }
            })
            .collect()
    }

    /// 开关灯
    pub async fn set_on_off(&self, device: &LogicalDevice, on: bool, mode: SyncMode) -> Result<()> {
        self.send_command(device, "set on/off", mode, |relay, seq| {
            pipe::set_on_off(relay, seq, device.index(), on)
        })
        .await
    }

    /// 设置亮度，取值 [1, 100]
    pub async fn set_brightness(
        &self,
        device: &LogicalDevice,
        brightness: u8,
        mode: SyncMode,
    ) -> Result<()> {
        self.send_command(device, "set brightness", mode, |relay, seq| {
            pipe::set_brightness(relay, seq, device.index(), brightness)
        })
        .await
    }

    /// 设置色温，取值 [0, 100]
    pub async fn set_color_tone(
        &self,
        device: &LogicalDevice,
        tone: u8,
        mode: SyncMode,
    ) -> Result<()> {
        self.send_command(device, "set color tone", mode, |relay, seq| {
            pipe::set_color_tone(relay, seq, device.index(), tone)
        })
        .await
    }

    pub async fn set_rgb(
        &self,
        device: &LogicalDevice,
        rgb: (u8, u8, u8),
        mode: SyncMode,
    ) -> Result<()> {
        let (r, g, b) = rgb;
        self.send_command(device, "set rgb", mode, |relay, seq| {
            pipe::set_rgb(relay, seq, device.index(), r, g, b)
        })
        .await
    }

    /// 通过当前 relay 发送命令，失败时轮转到下一个 relay
    async fn send_command<F>(
        &self,
        device: &LogicalDevice,
        operation: &'static str,
        mode: SyncMode,
        build: F,
    ) -> Result<()>
    where
        F: FnOnce(u32, u16) -> Packet,
    {
        let relay = self
            .routing
            .current_relay(device.id())
            .map_err(|e| e.context(operation, device.id()))?;
        let packet = build(relay, self.next_seq());

        let mut acked = false;
        let res = self
            .call_and_wait(vec![packet], true, |packet| {
                if packet.packet_type != PacketType::Pipe || packet.address() != Some(relay) {
                    return Step::Continue;
                }
                if !acked {
                    // 确认之前收到的同步报文可能是之前请求遗留的
                    if packet.is_response {
                        acked = true;
                        if mode == SyncMode::Async {
                            return Step::Done;
                        }
                    }
                    return Step::Continue;
                }
                if pipe::is_sync_marker(packet, relay) {
                    Step::Done
                } else {
                    Step::Continue
                }
            })
            .await;

        match res {
            Ok(()) => Ok(()),
            // 同步报文并不总会到达，已确认即视为成功
            Err(Error::Timeout) if acked => {
                warn!(
                    "{} {}: no sync packet from relay {:#x}, assuming applied",
                    operation,
                    device.id(),
                    relay
                );
                Ok(())
            }
            Err(e) => {
                self.failover(device.id());
                Err(e.context(operation, device.id()))
            }
        }
    }

    /// 在一个会话内，通过每个设备最多 `max_relays` 个 relay 同时发送开关命令
    ///
    /// 任一 relay 确认即视为该设备成功，所有 relay 都拒绝时为 `RemoteCall`
    pub async fn blast_on_off(
        &self,
        devices: &[Arc<LogicalDevice>],
        on: bool,
        max_relays: usize,
    ) -> Vec<Result<()>> {
        let mut results: Vec<Option<Result<()>>> = devices.iter().map(|_| None).collect();
        let mut packets = Vec::new();
        // (relay, seq) -> 设备下标
        let mut sent: HashMap<(u32, u16), usize> = HashMap::new();
        for (i, device) in devices.iter().enumerate() {
            let relays = self.routing.relays(device.id());
            if relays.is_empty() {
                results[i] = Some(Err(Error::Unreachable));
                continue;
            }
            for relay in relays.into_iter().take(max_relays.max(1)) {
                let seq = packets.len() as u16;
                packets.push(pipe::set_on_off(relay, seq, device.index(), on));
                sent.insert((relay, seq), i);
            }
        }

        let mut waiting: HashSet<usize> = sent.values().copied().collect();
        let mut acked: Vec<Option<u32>> = vec![None; devices.len()];
        // 每个设备还未应答的 relay 数
        let mut remaining: Vec<usize> = vec![0; devices.len()];
        for &i in sent.values() {
            remaining[i] += 1;
        }
        let mut refused: Vec<bool> = vec![false; devices.len()];
        let res = if packets.is_empty() {
            Ok(())
        } else {
            self.call_and_wait(packets, false, |packet| {
                if packet.packet_type != PacketType::Pipe || !packet.is_response {
                    return Step::Continue;
                }
                let (relay, seq) = match (packet.address(), packet.sequence()) {
                    (Some(relay), Some(seq)) => (relay, seq),
                    _ => return Step::Continue,
                };
                // 每个 (relay, seq) 只处理第一个应答
                if let Some(i) = sent.remove(&(relay, seq)) {
                    if packet.is_nack() {
                        remaining[i] -= 1;
                        if remaining[i] == 0 && waiting.remove(&i) {
                            refused[i] = true;
                        }
                    } else if waiting.remove(&i) {
                        acked[i] = Some(relay);
                    }
                }
                if waiting.is_empty() {
                    Step::Done
                } else {
                    Step::Continue
                }
            })
            .await
        };

        let shared = res.err().map(Arc::new);
        devices
            .iter()
            .zip(results)
            .zip(acked)
            .zip(refused)
            .map(|(((device, result), acked), refused)| {
                let res = match (result, acked) {
                    (Some(res), _) => res,
                    (None, Some(relay)) => {
                        self.routing
                            .record_success(device.id(), relay, device.is_own_relay(relay));
                        Ok(())
                    }
                    (None, None) => {
                        self.failover(device.id());
                        if refused {
                            Err(Error::RemoteCall)
                        } else {
                            Err(shared.clone().map(Error::Shared).unwrap_or(Error::Timeout))
                        }
                    }
                };
                res.map_err(|e| e.context("blast on/off", device.id()))
            })
            .collect()
    }

    /// 建立会话，发送报文，并用 `matcher` 逐个检查入站报文，直到完成或超时
    ///
    /// `check_error` 为 true 时，任何响应负载最后一个字节非零都视为远端返回错误
    pub async fn call_and_wait<F>(
        &self,
        packets: Vec<Packet>,
        check_error: bool,
        mut matcher: F,
    ) -> Result<()>
    where
        F: FnMut(&Packet) -> Step,
    {
        let _session = self.session.lock().await;

        // 认证失败时连接随 drop 关闭
        let mut conn = self.dialer.dial().await?;
        let credentials = self.credentials();
        conn.authenticate(credentials.user_id, &credentials.authorize, self.timeout)
            .await?;
        debug!("session authenticated, sending {} packet(s)", packets.len());

        let (reader, mut writer) = conn.into_split();
        let (packet_tx, mut packet_rx) = mpsc::channel(PACKET_QUEUE_SIZE);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let _reader = ReadTask {
            cancel: Some(cancel_tx),
            handle: tokio::spawn(read_loop(reader, check_error, packet_tx, cancel_rx)),
        };

        let res = self
            .exchange(&mut writer, &packets, &mut packet_rx, &mut matcher)
            .await;
        writer.close().await;
        res
    }

    async fn exchange<W, F>(
        &self,
        writer: &mut PacketWriter<W>,
        packets: &[Packet],
        packet_rx: &mut mpsc::Receiver<Result<Packet>>,
        matcher: &mut F,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        F: FnMut(&Packet) -> Step,
    {
        // 写入也计入超时，对端不读取时不会阻塞
        let deadline = time::sleep(self.timeout);
        tokio::pin!(deadline);
        for packet in packets {
            select! {
                res = writer.write_packet(packet) => res?,
                _ = &mut deadline => return Err(Error::Timeout),
            }
        }

        loop {
            select! {
                recv = packet_rx.recv() => match recv {
                    Some(Ok(packet)) => match matcher(&packet) {
                        Step::Continue => {}
                        Step::Done => return Ok(()),
                        Step::Fail(e) => return Err(e),
                    },
                    Some(Err(e)) => return Err(e),
                    None => return Err(Error::ConnectionClosed),
                },
                _ = &mut deadline => return Err(Error::Timeout),
            }
        }
    }

    fn failover(&self, device: DeviceId) {
        if let Some(relay) = self.routing.record_failure(device) {
            info!("device {} fails over to relay {:#x}", device, relay);
        }
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// 后台读任务，drop 时通知其停止并中止
struct ReadTask {
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Drop for ReadTask {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.handle.abort();
    }
}

/// 逐个读取报文放入队列，按到达顺序交付
///
/// 队列满时同时等待取消信号，调用方返回后不会永远阻塞
async fn read_loop<R>(
    mut reader: PacketReader<R>,
    check_error: bool,
    packet_tx: mpsc::Sender<Result<Packet>>,
    mut cancel: oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let item = select! {
            _ = &mut cancel => return,
            read = reader.read_packet() => match read {
                Ok(packet) if check_error && packet.is_nack() => Err(Error::RemoteCall),
                Ok(packet) => Ok(packet),
                Err(e) => Err(Error::Connection(e)),
            },
        };

        let stop = item.is_err();
        select! {
            _ = &mut cancel => return,
            sent = packet_tx.send(item) => if sent.is_err() {
                return;
            },
        }
        if stop {
            return;
        }
    }
}

#[cfg(test)]
mod tests;
