//! End-to-end tests over a loopback coordinator
//!
//! The test plays the coordinator: it listens, the agent connects, and
//! commands go over a real TCP socket into the dispatcher.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shutterbug::sink::{COLOR_DIR, DEPTH_DIR};
use shutterbug::{
    CaptureSession, ControlLink, Dispatcher, DispatcherConfig, DiskSink, Framing, LinkOptions,
    RoleCell, SessionOptions, SyntheticSource,
};

struct Harness {
    coordinator: TcpStream,
    link: ControlLink,
    dispatcher: Arc<Dispatcher>,
}

fn harness(dataset_root: &Path, framing: Framing) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let session = Arc::new(CaptureSession::new(
        Box::new(SyntheticSource::new(8, 6, 200)),
        Arc::new(DiskSink::default()),
        SessionOptions {
            poll_timeout: Duration::from_millis(10),
            ..Default::default()
        },
    ));
    let config = DispatcherConfig {
        dataset_root: dataset_root.to_path_buf(),
        ..Default::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        session,
        Arc::new(RoleCell::new("TX")),
    ));

    let options = LinkOptions {
        framing,
        connect_timeout: Duration::from_secs(2),
    };
    let mut link = ControlLink::connect(&addr, &options).unwrap();
    let (coordinator, _) = listener.accept().unwrap();
    coordinator
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    link.spawn(Arc::clone(&dispatcher)).unwrap();

    Harness {
        coordinator,
        link,
        dispatcher,
    }
}

impl Harness {
    fn send(&mut self, text: &str) {
        self.coordinator.write_all(text.as_bytes()).unwrap();
    }

    fn read_reply(&mut self) -> String {
        let mut buf = [0u8; 256];
        let n = self.coordinator.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn test_ack_is_answered_with_identity() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path(), Framing::Chunk);

    h.send("please ack now");
    assert_eq!(h.read_reply(), "Orbbec_main");
}

#[test]
fn test_capture_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path(), Framing::Chunk);

    h.send("set,RX");
    wait_until("role change", || &*h.dispatcher.role().get() == "RX");

    h.send("exec,start HW --_folder");
    let session = Arc::clone(h.dispatcher.session());
    wait_until("session running", || session.is_active());
    wait_until("some frames saved", || {
        session.stats().map(|s| s.completed >= 3).unwrap_or(false)
    });

    h.send("exec,stop");
    wait_until("session stopped", || !session.is_active());
    assert!(session.wait_idle(Duration::from_secs(5)));

    let root = dir.path().join("RX_folder");
    let report = session.last_report().unwrap();
    assert_eq!(report.root, root);
    let saved = report.stats.completed as usize;
    assert!(saved >= 3);
    assert_eq!(count(&root.join(COLOR_DIR)), saved);
    assert_eq!(count(&root.join(DEPTH_DIR)), saved);

    // Nothing more is written once the session is idle
    thread::sleep(Duration::from_millis(50));
    assert_eq!(count(&root.join(COLOR_DIR)), saved);
}

#[test]
fn test_line_framing_splits_coalesced_messages() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path(), Framing::Line);

    h.send("set,RX\nack\n");
    assert_eq!(h.read_reply(), "Orbbec_main\n");
    assert_eq!(&*h.dispatcher.role().get(), "RX");
}

#[test]
fn test_coordinator_hangup_ends_link() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path(), Framing::Chunk);
    assert!(h.link.is_alive());

    let Harness {
        coordinator, link, ..
    } = h;
    drop(coordinator);
    wait_until("link down", || !link.is_alive());
}

#[test]
fn test_stop_unblocks_idle_link() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path(), Framing::Chunk);

    let started = Instant::now();
    h.link.stop();
    assert!(!h.link.is_alive());
    assert!(started.elapsed() < Duration::from_secs(2));

    // Coordinator sees the close
    let mut buf = [0u8; 16];
    assert_eq!(h.coordinator.read(&mut buf).unwrap(), 0);
}
