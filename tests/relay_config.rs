use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use capture_relay::{DirectoryResolution, LayoutMode, RelayConfig, ResponseFormat};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RELAY_CONFIG",
        "RELAY_LISTEN_ADDR",
        "RELAY_SOURCE_DIR",
        "RELAY_TARGET_DIR",
        "RELAY_OUTPUT_DIR",
        "RELAY_OUTPUT_FILE",
        "RELAY_MAX_RETRIES",
        "RELAY_RETRY_BACKOFF_MS",
        "RELAY_READ_TIMEOUT_SECS",
        "RELAY_WRITE_TIMEOUT_SECS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RelayConfig::load().expect("load defaults");

    assert_eq!(cfg.listen_addr, "0.0.0.0:8050");
    assert_eq!(cfg.layout.mode, LayoutMode::Folders);
    assert_eq!(cfg.layout.source, PathBuf::from("output/source"));
    assert_eq!(cfg.layout.target, PathBuf::from("output/target"));
    assert_eq!(cfg.layout.output, PathBuf::from("output/swapped"));
    assert_eq!(cfg.layout.output_file, "swapped.jpg");
    assert_eq!(cfg.response_format, ResponseFormat::Headered);
    assert_eq!(cfg.retry.max_retries, 3);
    assert_eq!(cfg.retry.backoff, Duration::ZERO);
    assert_eq!(cfg.read_timeout, None);
    assert_eq!(cfg.write_timeout, None);
    assert!(cfg.stop_on_exit);

    clear_env();
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "listen_addr": "127.0.0.1:9050",
            "response_format": "raw",
            "stop_on_exit": false,
            "layout": {
                "source": "/srv/relay/in/source",
                "target": "/srv/relay/in/target",
                "output": "/srv/relay/out",
                "output_file": "result.jpg"
            },
            "transfer": {
                "max_retries": 5,
                "backoff_ms": 250,
                "chunk_size": 8192
            },
            "stream": { "max_frame_bytes": 1048576 },
            "timeouts": { "read_secs": 30, "write_secs": 0 }
        }"#,
    );

    std::env::set_var("RELAY_CONFIG", file.path());
    std::env::set_var("RELAY_TARGET_DIR", "/mnt/target");
    std::env::set_var("RELAY_MAX_RETRIES", "1");
    std::env::set_var("RELAY_WRITE_TIMEOUT_SECS", "10");

    let cfg = RelayConfig::load().expect("load config");

    assert_eq!(cfg.listen_addr, "127.0.0.1:9050");
    assert_eq!(cfg.response_format, ResponseFormat::Raw);
    assert!(!cfg.stop_on_exit);
    assert_eq!(cfg.layout.source, PathBuf::from("/srv/relay/in/source"));
    assert_eq!(cfg.layout.target, PathBuf::from("/mnt/target"));
    assert_eq!(cfg.layout.output_file, "result.jpg");
    assert_eq!(cfg.retry.max_retries, 1);
    assert_eq!(cfg.retry.backoff, Duration::from_millis(250));
    assert_eq!(cfg.chunk_size, 8192);
    assert_eq!(cfg.max_frame_bytes, 1_048_576);
    assert_eq!(cfg.read_timeout, Some(Duration::from_secs(30)));
    assert_eq!(cfg.write_timeout, Some(Duration::from_secs(10)));

    let server = cfg.server_config();
    assert_eq!(server.addr, "127.0.0.1:9050");
    assert_eq!(server.profile.retry.max_retries, 1);
    assert!(!server.stop_on_exit);

    clear_env();
}

#[test]
fn loads_fixed_layout_from_toml() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
listen_addr = "0.0.0.0:8051"
response_format = "raw"

[layout]
mode = "fixed"
source = "/tmp/relay/source.jpg"
target = "/tmp/relay/target.mp4"
output = "/tmp/relay/swapped.jpg"
"#,
    );

    let cfg = RelayConfig::load_from(Some(file.path())).expect("load toml");

    assert_eq!(cfg.layout.mode, LayoutMode::Fixed);
    assert_eq!(
        cfg.resolution(),
        DirectoryResolution::FixedFiles {
            source_file: PathBuf::from("/tmp/relay/source.jpg"),
            target_file: PathBuf::from("/tmp/relay/target.mp4"),
            output_file: PathBuf::from("/tmp/relay/swapped.jpg"),
        }
    );
    assert_eq!(cfg.session_profile().response_format, ResponseFormat::Raw);

    clear_env();
}

#[test]
fn fixed_layout_requires_all_paths() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
[layout]
mode = "fixed"
source = "/tmp/relay/source.jpg"
"#,
    );

    let err = RelayConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("fixed layout"));

    clear_env();
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RELAY_MAX_RETRIES", "many");
    let err = RelayConfig::load().unwrap_err();
    assert!(err.to_string().contains("RELAY_MAX_RETRIES"));
    clear_env();

    std::env::set_var("RELAY_LISTEN_ADDR", "not-an-address");
    let err = RelayConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid listen address"));
    clear_env();

    std::env::set_var("RELAY_OUTPUT_FILE", "..");
    assert!(RelayConfig::load().is_err());

    clear_env();
}

#[test]
fn zero_timeout_disables_it() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RELAY_READ_TIMEOUT_SECS", "0");
    let cfg = RelayConfig::load().expect("load config");
    assert_eq!(cfg.read_timeout, None);

    clear_env();
}
