use curvemq::{Allow, AuthLevel, Config, CurveMq, Message};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Window after which we declare that a message was (correctly) not
/// delivered. Long enough for loopback delivery, short enough for the suite.
pub const SILENCE: Duration = Duration::from_millis(700);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A listening node admitting every handshake at the given level.
pub fn server_config(auth: AuthLevel, remote_sn: bool) -> Config {
    Config {
        bind: vec!["tcp://127.0.0.1:*".into()],
        allow_connection: Some(Box::new(move |_ip, _pk| Allow::new(auth, remote_sn))),
        general_workers: 2,
        ..Config::default()
    }
}

/// An outbound-only node.
pub fn client_config() -> Config {
    Config {
        general_workers: 2,
        ..Config::default()
    }
}

pub fn start(mut node: CurveMq) -> CurveMq {
    node.start().expect("start failed");
    node
}

/// A command callback that forwards each invocation's data parts to a
/// channel the test can wait on.
pub fn capture() -> (
    impl Fn(&mut Message<'_>) + Send + Sync + 'static,
    mpsc::Receiver<Vec<Vec<u8>>>,
) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let callback = move |msg: &mut Message<'_>| {
        let parts: Vec<Vec<u8>> = msg.data.iter().map(|d| d.to_vec()).collect();
        let _ = tx.lock().unwrap().send(parts);
    };
    (callback, rx)
}

/// Asserts that no invocation arrives within the silence window.
pub fn assert_silent(rx: &mpsc::Receiver<Vec<Vec<u8>>>) {
    match rx.recv_timeout(SILENCE) {
        Err(mpsc::RecvTimeoutError::Timeout) => {}
        Ok(parts) => panic!("unexpected invocation with {} parts", parts.len()),
        Err(e) => panic!("channel failed: {e}"),
    }
}
