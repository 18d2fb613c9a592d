use std::io::{Cursor, Read};
use std::net::TcpStream;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use tempfile::tempdir;

use capture_relay::{
    CaptureClient, Command, DecodedFrame, DirectoryResolution, FrameControl, NullProcessor,
    Processor, RelayError, RelayHandle, RelayServer, ServerConfig, SessionProfile,
};

const WAIT: Duration = Duration::from_secs(5);

fn server_config(root: &Path) -> ServerConfig {
    ServerConfig {
        addr: "127.0.0.1:0".to_string(),
        profile: SessionProfile {
            layout: DirectoryResolution::Folders {
                source_dir: root.join("source"),
                target_dir: root.join("target"),
                output_dir: root.join("swapped"),
                output_file: "swapped.jpg".to_string(),
            },
            ..SessionProfile::default()
        },
        read_timeout: Some(WAIT),
        write_timeout: Some(WAIT),
        stop_on_exit: true,
        stop_after_ready: false,
    }
}

fn connect(handle: &RelayHandle) -> CaptureClient<TcpStream> {
    CaptureClient::connect(handle.addr, Some(WAIT)).expect("connect")
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([40, 90, 200]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .expect("encode jpeg");
    out.into_inner()
}

struct FrameSink(mpsc::Sender<(u32, u32)>);

impl Processor for FrameSink {
    fn on_frame(&mut self, frame: DecodedFrame) -> FrameControl {
        let _ = self.0.send((frame.width, frame.height));
        FrameControl::Continue
    }
}

#[test]
fn source_and_target_make_the_session_ready() {
    let dir = tempdir().expect("tempdir");
    let handle = RelayServer::new(server_config(dir.path()), NullProcessor)
        .spawn()
        .expect("spawn relay");

    let source = dir.path().join("face.jpg");
    let target = dir.path().join("clip.mp4");
    std::fs::write(&source, b"source bytes").unwrap();
    std::fs::write(&target, vec![7u8; 10_000]).unwrap();

    let mut client = connect(&handle);
    assert_eq!(client.send_source(&source).unwrap().retries, 0);
    assert_eq!(client.send_target(&target).unwrap().retries, 0);

    let files = handle
        .ready_signal()
        .wait_timeout(WAIT)
        .expect("ready signal");
    let stored_source = files.source.expect("source path");
    let stored_target = files.target.expect("target path");
    assert_eq!(stored_source, dir.path().join("source").join("face.jpg"));
    assert_eq!(stored_target, dir.path().join("target").join("clip.mp4"));
    assert_eq!(std::fs::read(stored_source).unwrap(), b"source bytes");
    assert_eq!(std::fs::read(stored_target).unwrap(), vec![7u8; 10_000]);

    let stats = handle.stop().expect("stop relay");
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.ready_sessions, 1);
}

#[test]
fn gate_does_not_carry_across_connections() {
    let dir = tempdir().expect("tempdir");
    let handle = RelayServer::new(server_config(dir.path()), NullProcessor)
        .spawn()
        .expect("spawn relay");

    let mut first = connect(&handle);
    first
        .upload_bytes(Command::SendSource, "face.jpg", b"abc")
        .unwrap();
    first.finish().unwrap();

    let mut second = connect(&handle);
    second
        .upload_bytes(Command::SendTarget, "clip.mp4", b"def")
        .unwrap();
    second.finish().unwrap();

    assert_eq!(
        handle
            .ready_signal()
            .wait_timeout(Duration::from_millis(300)),
        None
    );
    assert!(dir.path().join("source/face.jpg").exists());
    assert!(dir.path().join("target/clip.mp4").exists());

    let mut last = connect(&handle);
    last.exit().unwrap();
    let stats = handle.wait().expect("relay exits");
    assert_eq!(stats.sessions, 3);
    assert_eq!(stats.ready_sessions, 0);
}

#[test]
fn request_file_returns_processed_output() {
    let dir = tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("swapped")).unwrap();
    std::fs::write(dir.path().join("swapped/swapped.jpg"), b"processed").unwrap();
    std::fs::write(dir.path().join("swapped/other.jpg"), b"other").unwrap();

    let handle = RelayServer::new(server_config(dir.path()), NullProcessor)
        .spawn()
        .expect("spawn relay");
    let downloads = tempdir().expect("downloads");

    let mut client = connect(&handle);
    let default_output = client.request_file(None, downloads.path()).unwrap();
    assert_eq!(std::fs::read(default_output).unwrap(), b"processed");

    // A path is reduced to its base name inside the output directory.
    let named = client
        .request_file(Some("../../other.jpg"), downloads.path())
        .unwrap();
    assert_eq!(named, downloads.path().join("other.jpg"));
    assert_eq!(std::fs::read(named).unwrap(), b"other");

    client.exit().unwrap();
    let stats = handle.wait().expect("relay exits");
    assert_eq!(stats.sessions, 1);
}

#[test]
fn missing_output_gets_no_response() {
    let dir = tempdir().expect("tempdir");
    let handle = RelayServer::new(server_config(dir.path()), NullProcessor)
        .spawn()
        .expect("spawn relay");
    let downloads = tempdir().expect("downloads");

    let mut client =
        CaptureClient::connect(handle.addr, Some(Duration::from_millis(200))).expect("connect");
    let err = client
        .request_file(Some("absent.jpg"), downloads.path())
        .unwrap_err();
    assert!(matches!(err, RelayError::Io(_)));

    // The session is still usable after the silent miss.
    client.exit().unwrap();
    handle.wait().expect("relay exits");
}

#[test]
fn live_frames_reach_the_processor() {
    let dir = tempdir().expect("tempdir");
    let (tx, rx) = mpsc::channel();
    let handle = RelayServer::new(server_config(dir.path()), FrameSink(tx))
        .spawn()
        .expect("spawn relay");

    let mut client = connect(&handle);
    client.start_frames().unwrap();
    client.send_frame(&jpeg(16, 8)).unwrap();
    client.send_frame(b"noise between frames").unwrap();
    client.send_frame(&jpeg(32, 16)).unwrap();
    client.send_frame(&jpeg(8, 8)).unwrap();
    client.finish().unwrap();

    let mut sizes = Vec::new();
    for _ in 0..3 {
        sizes.push(rx.recv_timeout(WAIT).expect("frame"));
    }
    assert_eq!(sizes, vec![(16, 8), (32, 16), (8, 8)]);

    let stats = handle.stop().expect("stop relay");
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.ready_sessions, 0);
}

#[test]
fn target_before_stream_is_ready_immediately() {
    let dir = tempdir().expect("tempdir");
    let handle = RelayServer::new(server_config(dir.path()), NullProcessor)
        .spawn()
        .expect("spawn relay");

    let mut client = connect(&handle);
    client
        .upload_bytes(Command::SendTarget, "clip.mp4", b"target")
        .unwrap();
    client.start_frames().unwrap();

    let files = handle
        .ready_signal()
        .wait_timeout(WAIT)
        .expect("ready signal");
    assert_eq!(files.source, None);
    assert_eq!(files.target, Some(dir.path().join("target/clip.mp4")));

    handle.stop().expect("stop relay");
}

#[test]
fn stop_closes_an_idle_session() {
    let dir = tempdir().expect("tempdir");
    let cfg = ServerConfig {
        read_timeout: None,
        write_timeout: None,
        ..server_config(dir.path())
    };
    let handle = RelayServer::new(cfg, NullProcessor)
        .spawn()
        .expect("spawn relay");

    // A request for a missing file gets no reply, leaving the session blocked
    // on the next command.
    let mut idle = TcpStream::connect(handle.addr).expect("connect");
    std::io::Write::write_all(&mut idle, b"{\"command\":\"REQUEST_FILE\"}\n").unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(handle.stop());
    });
    let stats = rx
        .recv_timeout(WAIT)
        .expect("stop returns while a peer is idle")
        .expect("stop relay");
    assert_eq!(stats.sessions, 1);

    idle.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(idle.read(&mut buf).unwrap_or(0), 0);
}

#[test]
fn stop_after_ready_ends_the_cycle_with_one_hand_off() {
    let dir = tempdir().expect("tempdir");
    let cfg = ServerConfig {
        stop_after_ready: true,
        ..server_config(dir.path())
    };
    let handle = RelayServer::new(cfg, NullProcessor)
        .spawn()
        .expect("spawn relay");

    let mut first = connect(&handle);
    first
        .upload_bytes(Command::SendSource, "face.jpg", b"src")
        .unwrap();
    // Queued behind the active session; never served in this cycle.
    let _second = TcpStream::connect(handle.addr).expect("connect");
    first
        .upload_bytes(Command::SendTarget, "clip.mp4", b"tgt")
        .unwrap();

    let files = handle
        .ready_signal()
        .wait_timeout(WAIT)
        .expect("ready signal");
    assert_eq!(files.target, Some(dir.path().join("target/clip.mp4")));

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(handle.wait());
    });
    let stats = rx
        .recv_timeout(WAIT)
        .expect("listener stops after the hand-off")
        .expect("relay result");
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.ready_sessions, 1);
}
