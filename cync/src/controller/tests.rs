use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{duplex, DuplexStream};

use super::*;
use crate::{
    account::{DeviceDescriptor, StaticAccount},
    network::{
        conn::{self, Connection},
        packet::auth,
    },
};

const TIMEOUT: Duration = Duration::from_millis(200);
const LONG_TIMEOUT: Duration = Duration::from_secs(5);

const RELAY_A: u32 = 100;
const RELAY_B: u32 = 200;
const HOME: u32 = 900;

type Script = Arc<dyn Fn(&Packet) -> Vec<Packet> + Send + Sync>;

/// 模拟服务端：认证后对每个请求按脚本回复
struct FakeDialer {
    script: Script,
    auth_reply: Vec<u8>,
    /// 认证后立即断开
    hangup: bool,
    /// 认证后不再读取请求
    stall: bool,
    /// 收到发往该 relay 的请求时断开
    drop_relay: Option<u32>,
    buffer: usize,
    dials: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Packet>>>,
}

impl FakeDialer {
    fn new(script: impl Fn(&Packet) -> Vec<Packet> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            auth_reply: auth::AUTH_SUCCESS.to_vec(),
            hangup: false,
            stall: false,
            drop_relay: None,
            buffer: 64 * 1024,
            dials: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    fn dials(&self) -> Arc<AtomicUsize> {
        self.dials.clone()
    }

    fn requests(&self) -> Arc<Mutex<Vec<Packet>>> {
        self.requests.clone()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    type Stream = DuplexStream;

    async fn dial(&self) -> Result<Connection<DuplexStream>, conn::Error> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (client, server) = duplex(self.buffer);
        tokio::spawn(serve(
            Connection::new(server),
            self.script.clone(),
            self.auth_reply.clone(),
            (self.hangup, self.stall, self.drop_relay),
            self.requests.clone(),
        ));
        Ok(Connection::new(client))
    }
}

async fn serve(
    mut conn: Connection<DuplexStream>,
    script: Script,
    auth_reply: Vec<u8>,
    (hangup, stall, drop_relay): (bool, bool, Option<u32>),
    requests: Arc<Mutex<Vec<Packet>>>,
) {
    match conn.read_packet().await {
        Ok(packet) if packet.packet_type == PacketType::Auth => {
            requests.lock().unwrap().push(packet);
        }
        _ => return,
    }
    if conn
        .write_packet(&Packet::response(PacketType::Auth, auth_reply))
        .await
        .is_err()
        || hangup
    {
        return;
    }
    if stall {
        // 保持连接但不再读取
        let _conn = conn;
        std::future::pending::<()>().await;
        return;
    }

    while let Ok(request) = conn.read_packet().await {
        requests.lock().unwrap().push(request.clone());
        if drop_relay.is_some() && request.address() == drop_relay {
            return;
        }
        for reply in script(&request) {
            if conn.write_packet(&reply).await.is_err() {
                return;
            }
        }
    }
}

/// 请求的确认报文，`status` 非零表示失败
fn reply(request: &Packet, status: u8) -> Packet {
    let mut stream = BytesMut::new();
    stream.put_slice(&request.payload[..6]);
    stream.put_slice(&[0x00, 0x7e, 0x00, 0x01, 0x00, 0x00, 0xf8]);
    stream.put_u8(pipe::subtype(request).unwrap_or_default());
    stream.put_slice(&[0x00, 0x00, 0x00, status]);
    Packet::response(PacketType::Pipe, stream.freeze())
}

fn ack(request: &Packet) -> Packet {
    reply(request, 0)
}

fn nack(request: &Packet) -> Packet {
    reply(request, 1)
}

fn sync(relay: u32) -> Packet {
    let mut stream = BytesMut::new();
    stream.put_u32(relay);
    stream.put_slice(&[0x00, 0x00, 0x00]);
    Packet::new(PacketType::Pipe, stream.freeze())
}

fn report(device_index: u16, brightness: u8) -> StatusReport {
    StatusReport {
        device_index,
        is_on: true,
        brightness,
        ..Default::default()
    }
}

fn is_status_query(request: &Packet) -> bool {
    pipe::subtype(request) == Some(pipe::GET_STATUS_PAGINATED)
}

fn credentials(user_id: u32) -> SessionCredentials {
    SessionCredentials {
        user_id,
        authorize: "token".into(),
        access_token: String::new(),
    }
}

/// 每个测试使用独立的会话锁，避免并行的测试互相等待
fn controller(dialer: FakeDialer, timeout: Duration) -> Controller<StaticAccount, FakeDialer> {
    Controller::with_dialer(
        dialer,
        Arc::new(StaticAccount::default()),
        credentials(1),
        timeout,
    )
    .with_session_lock(Box::leak(Box::new(tokio::sync::Mutex::new(()))))
}

fn pipe_requests(requests: &Mutex<Vec<Packet>>) -> Vec<Packet> {
    requests
        .lock()
        .unwrap()
        .iter()
        .filter(|p| p.packet_type == PacketType::Pipe)
        .cloned()
        .collect()
}

/// 设备经由 relay A、B 可达，当前选中 A
fn routed_device<A: Account, D: Dialer>(controller: &Controller<A, D>) -> LogicalDevice {
    let device = LogicalDevice::new(DeviceId(5001), HOME, "Lamp");
    controller.routing().record_success(device.id(), RELAY_A, false);
    controller.routing().record_success(device.id(), RELAY_B, false);
    device
}

#[tokio::test]
async fn command_through_current_relay() {
    let dialer = FakeDialer::new(|request| vec![ack(request), sync(request.address().unwrap())]);
    let requests = dialer.requests();
    let controller = controller(dialer, LONG_TIMEOUT);
    let device = routed_device(&controller);

    let start = Instant::now();
    controller
        .set_on_off(&device, true, SyncMode::Sync)
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));

    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), RELAY_A);
    let sent = pipe_requests(&requests);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].address(), Some(RELAY_A));
    assert_eq!(pipe::subtype(&sent[0]), Some(pipe::SET_STATUS));

    // 认证使用会话凭证
    let first = requests.lock().unwrap()[0].clone();
    assert_eq!(first.packet_type, PacketType::Auth);
    assert_eq!(first, auth::auth(1, "token").unwrap());
}

#[tokio::test]
async fn rejected_command_fails_over() {
    let dialer = FakeDialer::new(|request| match request.address() {
        Some(RELAY_A) => vec![nack(request)],
        Some(relay) => vec![ack(request), sync(relay)],
        None => Vec::new(),
    });
    let requests = dialer.requests();
    let controller = controller(dialer, LONG_TIMEOUT);
    let device = routed_device(&controller);

    let err = controller
        .set_brightness(&device, 50, SyncMode::Sync)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), Error::RemoteCall));
    assert!(matches!(
        err,
        Error::Device {
            operation: "set brightness",
            device: DeviceId(5001),
            ..
        }
    ));
    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), RELAY_B);

    controller
        .set_brightness(&device, 50, SyncMode::Sync)
        .await
        .unwrap();
    let sent = pipe_requests(&requests);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].address(), Some(RELAY_B));
    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), RELAY_B);
}

#[tokio::test]
async fn dropped_connection_fails_over() {
    let mut dialer = FakeDialer::new(|request| {
        vec![ack(request), sync(request.address().unwrap())]
    });
    dialer.drop_relay = Some(RELAY_A);
    let requests = dialer.requests();
    let controller = controller(dialer, LONG_TIMEOUT);
    let device = routed_device(&controller);

    let start = Instant::now();
    let err = controller
        .set_on_off(&device, true, SyncMode::Sync)
        .await
        .unwrap_err();
    assert!(matches!(
        err.root(),
        Error::Connection(conn::Error::ConnectionAborted)
    ));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), RELAY_B);

    controller
        .set_on_off(&device, true, SyncMode::Sync)
        .await
        .unwrap();
    let sent = pipe_requests(&requests);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].address(), Some(RELAY_B));
}

#[tokio::test]
async fn silent_relay_times_out_and_fails_over() {
    let controller = controller(FakeDialer::silent(), TIMEOUT);
    let device = routed_device(&controller);

    let start = Instant::now();
    let err = controller
        .set_color_tone(&device, 30, SyncMode::Sync)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() >= TIMEOUT);
    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), RELAY_B);
}

#[tokio::test]
async fn async_mode_returns_on_ack() {
    let controller = controller(FakeDialer::new(|request| vec![ack(request)]), LONG_TIMEOUT);
    let device = routed_device(&controller);

    let start = Instant::now();
    controller
        .set_rgb(&device, (255, 0, 0), SyncMode::Async)
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn missing_sync_assumed_applied() {
    let controller = controller(FakeDialer::new(|request| vec![ack(request)]), TIMEOUT);
    let device = routed_device(&controller);

    let start = Instant::now();
    controller
        .set_on_off(&device, false, SyncMode::Sync)
        .await
        .unwrap();
    assert!(start.elapsed() >= TIMEOUT);
    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), RELAY_A);
}

#[tokio::test]
async fn sync_before_ack_ignored() {
    // 确认之前的同步报文不算数，确认之后的才算
    let dialer = FakeDialer::new(|request| {
        let relay = request.address().unwrap();
        vec![sync(relay), ack(request), sync(relay)]
    });
    let controller = controller(dialer, LONG_TIMEOUT);
    let device = routed_device(&controller);

    let start = Instant::now();
    controller
        .set_on_off(&device, true, SyncMode::Sync)
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn unrouted_device_unreachable() {
    let dialer = FakeDialer::silent();
    let dials = dialer.dials();
    let controller = controller(dialer, TIMEOUT);
    let device = LogicalDevice::new(DeviceId(8001), HOME, "Nowhere");

    let err = controller
        .set_on_off(&device, true, SyncMode::Sync)
        .await
        .unwrap_err();
    assert!(err.is_unreachable());
    let err = controller.query_status(&device).await.unwrap_err();
    assert!(err.is_unreachable());
    assert_eq!(dials.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn call_and_wait_times_out() {
    let controller = controller(FakeDialer::silent(), TIMEOUT);

    let start = Instant::now();
    let res = controller
        .call_and_wait(vec![pipe::get_paginated_status(RELAY_A, 0)], false, |_| {
            Step::Continue
        })
        .await;
    assert!(matches!(res, Err(Error::Timeout)));
    assert!(start.elapsed() >= TIMEOUT);
}

#[tokio::test]
async fn call_and_wait_returns_when_matched() {
    let controller = controller(FakeDialer::new(|request| vec![ack(request)]), LONG_TIMEOUT);

    let mut seen = Vec::new();
    let start = Instant::now();
    controller
        .call_and_wait(
            vec![
                pipe::set_on_off(RELAY_A, 7, 1, true),
                pipe::set_on_off(RELAY_B, 8, 1, true),
            ],
            false,
            |packet| {
                seen.push(packet.sequence().unwrap());
                if seen.len() == 2 {
                    Step::Done
                } else {
                    Step::Continue
                }
            },
        )
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    // 按到达顺序交付
    assert_eq!(seen, vec![7, 8]);
}

#[tokio::test]
async fn matcher_failure_propagates() {
    let controller = controller(FakeDialer::new(|request| vec![ack(request)]), LONG_TIMEOUT);

    let res = controller
        .call_and_wait(vec![pipe::get_paginated_status(RELAY_A, 0)], false, |_| {
            Step::Fail(Error::MissingStatus)
        })
        .await;
    assert!(matches!(res, Err(Error::MissingStatus)));
}

#[tokio::test]
async fn nack_ignored_without_error_check() {
    let controller = controller(FakeDialer::new(|request| vec![nack(request)]), LONG_TIMEOUT);

    let res = controller
        .call_and_wait(vec![pipe::set_on_off(RELAY_A, 0, 1, true)], false, |packet| {
            assert!(packet.is_nack());
            Step::Done
        })
        .await;
    assert!(res.is_ok());

    let res = controller
        .call_and_wait(vec![pipe::set_on_off(RELAY_A, 0, 1, true)], true, |_| {
            Step::Done
        })
        .await;
    assert!(matches!(res, Err(Error::RemoteCall)));
}

#[tokio::test]
async fn server_hangup_reported() {
    let mut dialer = FakeDialer::silent();
    dialer.hangup = true;
    let controller = controller(dialer, LONG_TIMEOUT);

    let start = Instant::now();
    let res = controller
        .call_and_wait(vec![], false, |_| Step::Continue)
        .await;
    assert!(matches!(
        res,
        Err(Error::Connection(conn::Error::ConnectionAborted))
    ));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn auth_rejected() {
    let mut dialer = FakeDialer::silent();
    dialer.auth_reply = vec![0x00, 0x01];
    let requests = dialer.requests();
    let controller = controller(dialer, TIMEOUT);

    let res = controller
        .call_and_wait(vec![pipe::get_paginated_status(RELAY_A, 0)], false, |_| {
            Step::Done
        })
        .await;
    assert!(matches!(
        res,
        Err(Error::Connection(conn::Error::AuthRejected))
    ));
    // 认证失败后不发送请求
    assert!(pipe_requests(&requests).is_empty());
}

#[tokio::test]
async fn sessions_are_serialized() {
    let controller = controller(FakeDialer::silent(), TIMEOUT);

    let start = Instant::now();
    let (first, second) = tokio::join!(
        controller.call_and_wait(vec![], false, |_| Step::Continue),
        controller.call_and_wait(vec![], false, |_| Step::Continue),
    );
    assert!(first.unwrap_err().is_timeout());
    assert!(second.unwrap_err().is_timeout());
    assert!(start.elapsed() >= TIMEOUT * 2);
}

#[tokio::test]
async fn controllers_share_process_session() {
    let first = Controller::with_dialer(
        FakeDialer::silent(),
        Arc::new(StaticAccount::default()),
        credentials(1),
        TIMEOUT,
    );
    let second = Controller::with_dialer(
        FakeDialer::silent(),
        Arc::new(StaticAccount::default()),
        credentials(2),
        TIMEOUT,
    );

    let start = Instant::now();
    let (a, b) = tokio::join!(
        first.call_and_wait(vec![], false, |_| Step::Continue),
        second.call_and_wait(vec![], false, |_| Step::Continue),
    );
    assert!(a.unwrap_err().is_timeout());
    assert!(b.unwrap_err().is_timeout());
    assert!(start.elapsed() >= TIMEOUT * 2);
}

#[tokio::test]
async fn stalled_peer_bounded_by_timeout() {
    let mut dialer = FakeDialer::silent();
    dialer.stall = true;
    dialer.buffer = 64;
    let controller = controller(dialer, TIMEOUT);

    let packets = (0..16)
        .map(|seq| pipe::get_paginated_status(RELAY_A, seq))
        .collect();
    let start = Instant::now();
    let res = controller
        .call_and_wait(packets, false, |_| Step::Continue)
        .await;
    assert!(matches!(res, Err(Error::Timeout)));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn query_prefers_own_relay() {
    let dialer = FakeDialer::new(|request| {
        if !is_status_query(request) {
            return Vec::new();
        }
        let relay = request.address().unwrap();
        let brightness = if relay == HOME { 90 } else { 10 };
        vec![status::encode_paginated_status(relay, &[report(1, brightness)])]
    });
    let controller = controller(dialer, LONG_TIMEOUT);
    let device = LogicalDevice::new(DeviceId(5001), HOME, "Lamp");
    controller.routing().record_success(device.id(), RELAY_A, false);
    controller.routing().record_success(device.id(), HOME, false);

    let status = controller.query_status(&device).await.unwrap();
    assert!(status.online);
    assert_eq!(status.report.brightness, 90);
    assert_eq!(device.last_status(), status);
    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), HOME);
}

#[tokio::test]
async fn query_prefers_current_relay() {
    let dialer = FakeDialer::new(|request| {
        let relay = request.address().unwrap();
        let brightness = if relay == RELAY_A { 20 } else { 80 };
        vec![status::encode_paginated_status(relay, &[report(1, brightness)])]
    });
    let controller = controller(dialer, LONG_TIMEOUT);
    let device = routed_device(&controller);
    // 当前选中 B
    controller.routing().record_failure(device.id());

    let status = controller.query_status(&device).await.unwrap();
    assert_eq!(status.report.brightness, 80);
    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), RELAY_B);
}

#[tokio::test]
async fn query_keeps_candidate_on_timeout() {
    // 当前 relay 不响应，另一个 relay 的结果在超时后仍然有效
    let dialer = FakeDialer::new(|request| match request.address() {
        Some(RELAY_B) => vec![status::encode_paginated_status(RELAY_B, &[report(1, 40)])],
        _ => Vec::new(),
    });
    let controller = controller(dialer, TIMEOUT);
    let device = routed_device(&controller);

    let start = Instant::now();
    let status = controller.query_status(&device).await.unwrap();
    assert!(start.elapsed() >= TIMEOUT);
    assert_eq!(status.report.brightness, 40);
}

#[tokio::test]
async fn query_without_record_fails() {
    let dialer = FakeDialer::new(|request| {
        let relay = request.address().unwrap();
        vec![status::encode_paginated_status(relay, &[report(9, 40)])]
    });
    let controller = controller(dialer, LONG_TIMEOUT);
    let device = routed_device(&controller);

    let start = Instant::now();
    let err = controller.query_status(&device).await.unwrap_err();
    assert!(matches!(err.root(), Error::MissingStatus));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!device.last_status().online);
    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), RELAY_B);
}

#[tokio::test]
async fn batch_shares_relay_response() {
    const SHARED: u32 = 700;
    let dialer = FakeDialer::new(|request| {
        vec![status::encode_paginated_status(
            request.address().unwrap(),
            &[report(1, 10), report(2, 20)],
        )]
    });
    let requests = dialer.requests();
    let controller = controller(dialer, LONG_TIMEOUT);
    let devices = vec![
        Arc::new(LogicalDevice::new(DeviceId(5001), SHARED, "One")),
        Arc::new(LogicalDevice::new(DeviceId(5002), SHARED, "Two")),
    ];

    let results = controller.query_status_batch(&devices).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap().report.brightness, 10);
    assert_eq!(results[1].as_ref().unwrap().report.brightness, 20);
    assert_eq!(pipe_requests(&requests).len(), 1);
    for device in devices.iter() {
        assert!(device.last_status().online);
        assert_eq!(controller.routing().current_relay(device.id()).unwrap(), SHARED);
    }
}

#[tokio::test]
async fn batch_isolates_failures() {
    let dialer = FakeDialer::new(|request| match request.address() {
        Some(RELAY_A) => vec![status::encode_paginated_status(RELAY_A, &[report(1, 60)])],
        Some(RELAY_B) => vec![nack(request)],
        _ => Vec::new(),
    });
    let controller = controller(dialer, TIMEOUT);
    let devices = vec![
        Arc::new(LogicalDevice::new(DeviceId(1001), RELAY_A, "Answers")),
        Arc::new(LogicalDevice::new(DeviceId(2001), RELAY_B, "Rejects")),
        Arc::new(LogicalDevice::new(DeviceId(3001), 300, "Silent")),
    ];

    let results = controller.query_status_batch(&devices).await;
    assert_eq!(results[0].as_ref().unwrap().report.brightness, 60);
    assert!(matches!(
        results[1].as_ref().unwrap_err().root(),
        Error::RemoteCall
    ));
    assert!(results[2].as_ref().unwrap_err().is_timeout());
}

#[tokio::test]
async fn batch_ignores_other_meshes() {
    // 索引相同但属于其他家庭的记录不能归属
    let dialer = FakeDialer::new(|request| match request.address() {
        Some(RELAY_A) => vec![status::encode_paginated_status(RELAY_A, &[report(1, 10)])],
        _ => Vec::new(),
    });
    let controller = controller(dialer, TIMEOUT);
    let devices = vec![
        Arc::new(LogicalDevice::new(DeviceId(5001), RELAY_A, "Here")),
        Arc::new(LogicalDevice::new(DeviceId(6001), RELAY_B, "There")),
    ];

    let results = controller.query_status_batch(&devices).await;
    assert_eq!(results[0].as_ref().unwrap().report.brightness, 10);
    assert!(results[1].as_ref().unwrap_err().is_timeout());
    assert!(!devices[1].last_status().online);
}

#[tokio::test]
async fn enumerate_marks_offline_devices() {
    let dialer = FakeDialer::new(|request| match request.address() {
        Some(RELAY_A) => vec![status::encode_paginated_status(RELAY_A, &[report(1, 70)])],
        _ => Vec::new(),
    });
    let account = StaticAccount::new(
        Some(credentials(1)),
        vec![
            DeviceDescriptor {
                id: DeviceId(1001),
                switch_id: RELAY_A,
                name: "Kitchen".into(),
            },
            DeviceDescriptor {
                id: DeviceId(2001),
                switch_id: RELAY_B,
                name: "Porch".into(),
            },
        ],
    );
    let controller = Controller::with_dialer(dialer, Arc::new(account), credentials(1), TIMEOUT);

    let devices = controller.enumerate_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert!(devices[0].last_status().online);
    assert_eq!(devices[0].last_status().report.brightness, 70);
    assert!(!devices[1].last_status().online);

    let found = controller.find_device(DeviceId(1001)).unwrap();
    assert_eq!(found.name(), "Kitchen");
    assert!(Arc::ptr_eq(&found, &devices[0]));
    assert_eq!(controller.devices().len(), 2);
    assert!(controller.find_device(DeviceId(3001)).is_none());

    // 再次枚举沿用已有的设备对象
    let again = controller.enumerate_devices().await.unwrap();
    assert!(Arc::ptr_eq(&again[0], &devices[0]));
}

#[tokio::test]
async fn blast_reports_per_device() {
    const RELAY_C: u32 = 300;
    let dialer = FakeDialer::new(|request| match request.address() {
        Some(RELAY_B) => Vec::new(),
        _ => vec![ack(request)],
    });
    let requests = dialer.requests();
    let controller = controller(dialer, LONG_TIMEOUT);

    let first = Arc::new(LogicalDevice::new(DeviceId(1001), RELAY_A, "First"));
    let second = Arc::new(LogicalDevice::new(DeviceId(2001), HOME, "Second"));
    let missing = Arc::new(LogicalDevice::new(DeviceId(3001), HOME, "Missing"));
    controller.routing().record_success(first.id(), RELAY_A, true);
    controller.routing().record_success(second.id(), RELAY_B, false);
    controller.routing().record_success(second.id(), RELAY_C, false);

    let start = Instant::now();
    let results = controller
        .blast_on_off(&[first, second, missing], true, DEFAULT_BLAST_RELAYS)
        .await;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(results[2].as_ref().unwrap_err().is_unreachable());

    // 一个会话内发出所有命令
    let sent = pipe_requests(&requests);
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|p| pipe::subtype(p) == Some(pipe::SET_STATUS)));
}

#[tokio::test]
async fn blast_times_out_unacked_devices() {
    let controller = controller(FakeDialer::silent(), TIMEOUT);
    let device = Arc::new(routed_device(&controller));

    let results = controller.blast_on_off(&[device.clone()], false, 1).await;
    assert!(results[0].as_ref().unwrap_err().is_timeout());
    assert_eq!(controller.routing().current_relay(device.id()).unwrap(), RELAY_B);
}

#[tokio::test]
async fn blast_reports_refusals() {
    const RELAY_C: u32 = 300;
    let dialer = FakeDialer::new(|request| match request.address() {
        Some(RELAY_C) => vec![ack(request)],
        _ => vec![nack(request)],
    });
    let controller = controller(dialer, LONG_TIMEOUT);
    let refused = Arc::new(routed_device(&controller));
    // 一个 relay 拒绝，另一个确认
    let mixed = Arc::new(LogicalDevice::new(DeviceId(2001), HOME, "Mixed"));
    controller.routing().record_success(mixed.id(), RELAY_A, false);
    controller.routing().record_success(mixed.id(), RELAY_C, false);

    let start = Instant::now();
    let results = controller
        .blast_on_off(&[refused.clone(), mixed], true, 2)
        .await;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        results[0].as_ref().unwrap_err().root(),
        Error::RemoteCall
    ));
    assert!(results[1].is_ok());
    assert_eq!(controller.routing().current_relay(refused.id()).unwrap(), RELAY_B);
}

#[tokio::test]
async fn relogin_replaces_credentials() {
    let dialer = FakeDialer::new(|request| vec![ack(request)]);
    let requests = dialer.requests();
    let account = StaticAccount::new(Some(credentials(77)), Vec::new());
    let refreshed = Controller::with_dialer(dialer, Arc::new(account), credentials(1), TIMEOUT);

    refreshed.relogin().await.unwrap();
    assert_eq!(refreshed.credentials().user_id, 77);

    refreshed
        .call_and_wait(vec![], false, |_| Step::Done)
        .await
        .unwrap_err();
    let first = requests.lock().unwrap()[0].clone();
    assert_eq!(first, auth::auth(77, "token").unwrap());

    let rejected = controller(FakeDialer::silent(), TIMEOUT);
    assert!(matches!(
        rejected.relogin().await,
        Err(Error::Account(_))
    ));
    assert_eq!(rejected.credentials().user_id, 1);
}
