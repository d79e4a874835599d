// tests/self_target_tests.rs

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use self_target::config::{Config, EngineConfig};
use self_target::dispatch::{Dispatcher, dispatch_echo, dispatch_write_sink};
use self_target::{
    Access, AsyncRequest, Completion, Device, IoRequest, IoStatus, IoTarget, ModuleHost,
    RequestDescriptor, RequestEngine, RequestKind, SelfTarget, SelfTargetError, TargetState,
};

const IOCTL_ECHO: u32 = 0x0022_2003;

/// Device with a write sink, a slow read and an echo IOCTL.
fn test_device() -> Device {
    let mut d = Dispatcher::new();
    d.register(RequestKind::Write, dispatch_write_sink)
        .register(RequestKind::Read, |req: &mut IoRequest| {
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(400) {
                if req.is_cancelled() {
                    return Err(IoStatus::Unsuccessful(-1));
                }
                thread::sleep(Duration::from_millis(5));
            }
            Ok(0)
        })
        .register_ioctl(IOCTL_ECHO, dispatch_echo);
    Device::new("integration", d)
}

fn open_self_target(device: &Device) -> SelfTarget {
    let st = SelfTarget::create(device, &Config::default()).unwrap();
    st.open(device).unwrap();
    st
}

#[test]
fn open_get_close_lifecycle() {
    let dev = test_device();
    let st = SelfTarget::create(&dev, &Config::default()).unwrap();
    assert!(matches!(st.get(), Err(SelfTargetError::InvalidState(_))));

    st.open(&dev).unwrap();
    let target = st.get().unwrap();
    assert_eq!(target.state(), TargetState::Opened);
    assert_eq!(Some(target.clone()), st.engine().bound_target());

    st.close();
    assert!(matches!(st.get(), Err(SelfTargetError::InvalidState(_))));
    assert_eq!(target.state(), TargetState::Closed);
    assert!(st.engine().bound_target().is_none());
    assert_eq!(dev.open_handles(), 0);
}

#[test]
fn close_twice_is_a_no_op() {
    let dev = test_device();
    let st = open_self_target(&dev);
    st.close();
    st.close();
    assert!(!st.is_open());
}

#[test]
fn synchronous_write_reports_bytes_transferred() {
    let dev = test_device();
    let st = open_self_target(&dev);
    let payload = [0xabu8; 64];
    let n = st
        .send_synchronously(
            RequestDescriptor::new(RequestKind::Write, &payload, &mut []).timeout_ms(1_000),
        )
        .unwrap();
    assert_eq!(n, 64);
}

#[test]
fn asynchronous_ioctl_completes_once_with_response() {
    let dev = test_device();
    let st = open_self_target(&dev);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    st.send(
        AsyncRequest::new(RequestKind::DeviceControl, b"hello".to_vec(), 5).ioctl(IOCTL_ECHO),
        Some(Box::new(move |c: Completion| sink.lock().unwrap().push(c))),
    )
    .unwrap();

    let start = Instant::now();
    while seen.lock().unwrap().is_empty() {
        assert!(start.elapsed() < Duration::from_secs(5));
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(20));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].result, Ok(5));
    assert_eq!(seen[0].response, b"hello".to_vec());
}

#[test]
fn send_before_open_fails_without_callback() {
    let dev = test_device();
    let st = SelfTarget::create(&dev, &Config::default()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);

    let err = st
        .send(
            AsyncRequest::new(RequestKind::Write, vec![1, 2, 3], 0),
            Some(Box::new(move |_c: Completion| {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap_err();
    assert!(matches!(err, SelfTargetError::InvalidState(_)));

    let sync_err = st
        .send_synchronously(RequestDescriptor::new(RequestKind::Write, &[1], &mut []))
        .unwrap_err();
    assert!(matches!(sync_err, SelfTargetError::InvalidState(_)));

    drop(st);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn open_failure_leaves_instance_closed_and_retry_succeeds() {
    let dev = test_device();
    let st = SelfTarget::create(&dev, &Config::default()).unwrap();

    // an exclusive opener refuses to share the stack
    let exclusive = dev.open_handle(Access::READ_WRITE, Access::NONE).unwrap();
    let err = st.open(&dev).unwrap_err();
    assert_eq!(err, SelfTargetError::OpenFailure(IoStatus::SharingViolation));
    assert!(matches!(st.get(), Err(SelfTargetError::InvalidState(_))));
    assert!(st.engine().bound_target().is_none());

    drop(exclusive);
    st.open(&dev).unwrap();
    assert!(st.get().is_ok());
}

#[test]
fn open_against_another_device_is_refused() {
    let owner = test_device();
    let other = test_device();
    let st = SelfTarget::create(&owner, &Config::default()).unwrap();

    let err = st.open(&other).unwrap_err();
    assert_eq!(err, SelfTargetError::OpenFailure(IoStatus::InvalidParameter));
    assert!(matches!(st.get(), Err(SelfTargetError::InvalidState(_))));
    assert!(st.engine().bound_target().is_none());
    assert_eq!(owner.open_handles(), 0);
    assert_eq!(other.open_handles(), 0);

    // nothing reaches the foreign stack
    let sent = st.send_synchronously(RequestDescriptor::new(RequestKind::Write, &[0; 4], &mut []));
    assert!(matches!(sent, Err(SelfTargetError::InvalidState(_))));

    st.open(&owner).unwrap();
    assert_eq!(owner.open_handles(), 1);
}

#[test]
fn removed_device_is_a_creation_failure() {
    let dev = test_device();
    let st = SelfTarget::create(&dev, &Config::default()).unwrap();
    dev.remove();
    assert_eq!(
        st.open(&dev).unwrap_err(),
        SelfTargetError::CreationFailure(IoStatus::DeviceRemoved)
    );
    assert!(!st.is_open());
}

#[test]
fn zero_worker_engine_is_a_creation_failure() {
    let dev = test_device();
    let cfg = Config {
        engine: EngineConfig { worker_threads: 0, queue_depth: 4 },
        ..Config::default()
    };
    assert!(matches!(
        SelfTarget::create(&dev, &cfg),
        Err(SelfTargetError::CreationFailure(_))
    ));
}

#[test]
fn synchronous_timeout_is_bounded() {
    let dev = test_device();
    let st = open_self_target(&dev);
    let mut out = [0u8; 4];
    let start = Instant::now();
    let err = st
        .send_synchronously(RequestDescriptor::new(RequestKind::Read, &[], &mut out).timeout_ms(50))
        .unwrap_err();
    assert_eq!(err, SelfTargetError::Timeout(50));
    assert!(start.elapsed() < Duration::from_millis(350));
}

#[test]
fn unknown_ioctl_passes_stack_status_through() {
    let dev = test_device();
    let st = open_self_target(&dev);
    let err = st
        .send_synchronously(
            RequestDescriptor::new(RequestKind::DeviceControl, &[], &mut []).ioctl(0x1234),
        )
        .unwrap_err();
    assert_eq!(err, SelfTargetError::Transport(IoStatus::InvalidDeviceRequest(0x1234)));
}

#[test]
fn reopen_after_close_serves_requests_again() {
    let dev = test_device();
    let st = open_self_target(&dev);
    let first = st.get().unwrap();
    st.close();

    st.open(&dev).unwrap();
    let second = st.get().unwrap();
    assert_ne!(first, second);
    let n = st
        .send_synchronously(RequestDescriptor::new(RequestKind::Write, &[0; 8], &mut []))
        .unwrap();
    assert_eq!(n, 8);
}

#[test]
fn module_host_opens_on_prepare_and_closes_on_release() {
    let dev = test_device();
    let st = Arc::new(SelfTarget::create(&dev, &Config::default()).unwrap());
    let mut host = ModuleHost::new(dev.clone());
    host.add(st.clone());

    // D0 transitions do not touch a prepare-hardware module
    host.d0_entry().unwrap();
    assert!(!st.is_open());

    host.prepare_hardware().unwrap();
    assert!(st.is_open());
    assert_eq!(dev.open_handles(), 1);

    host.release_hardware();
    assert!(!st.is_open());
    assert_eq!(dev.open_handles(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_resolves_as_a_future() {
    let dev = test_device();
    let st = open_self_target(&dev);
    let pending = st
        .submit(AsyncRequest::new(RequestKind::DeviceControl, vec![9, 8, 7], 3).ioctl(IOCTL_ECHO))
        .unwrap();
    let done = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("request never completed");
    assert_eq!(done.result, Ok(3));
    assert_eq!(done.response, vec![9, 8, 7]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_reports_timeout() {
    let dev = test_device();
    let st = open_self_target(&dev);
    let pending = st
        .submit(AsyncRequest::new(RequestKind::Read, Vec::new(), 4).timeout_ms(30))
        .unwrap();
    let done = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap();
    assert_eq!(done.result, Err(SelfTargetError::Timeout(30)));
}
