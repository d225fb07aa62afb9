#![allow(dead_code)]

use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use smartlab_twin::core::config::Config;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_sltwin") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "sltwin.exe" } else { "sltwin" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve sltwin binary path for integration test"),
    }
}

/// Run the binary with `args`, keeping a log of the call for failure messages.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("sltwin-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("SLT_OUTPUT_FORMAT", "json")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute sltwin command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Default configuration with every path inside `dir`.
pub fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.paths.config_file = dir.join("config.toml");
    config.paths.live_db = dir.join("sensor_data_realtime.sqlite3");
    config.paths.history_db = dir.join("sensor_data_history.sqlite3");
    config.paths.selection_file = dir.join("shared_topic.json");
    config.paths.activity_log = dir.join("activity.jsonl");
    config.broker.host = "127.0.0.1".to_string();
    config.broker.port = 1;
    config
}

/// Write a config file for `dir` and return its path for `--config`.
pub fn write_config(dir: &Path) -> PathBuf {
    let config = config_in(dir);
    let raw = toml::to_string_pretty(&config).expect("serialize config");
    fs::write(&config.paths.config_file, raw).expect("write config");
    config.paths.config_file
}

/// Parse the last stdout line as JSON.
pub fn last_json(result: &CmdResult) -> serde_json::Value {
    let line = result
        .stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_else(|| panic!("no stdout; log: {}", result.log_path.display()));
    serde_json::from_str(line)
        .unwrap_or_else(|e| panic!("bad json {line:?}: {e}; log: {}", result.log_path.display()))
}

// --- scripted MQTT 3.1.1 broker -------------------------------------------

const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;
const DISCONNECT: u8 = 14;

/// Listener on an ephemeral local port.
pub fn broker_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind broker listener");
    let port = listener.local_addr().expect("broker addr").port();
    (listener, port)
}

/// Read one control packet: (first header byte, body).
pub fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 1];
    stream.read_exact(&mut header)?;
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte)?;
        len |= usize::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok((header[0], body))
}

fn write_packet(stream: &mut TcpStream, header: u8, body: &[u8]) -> io::Result<()> {
    let mut packet = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = u8::try_from(len % 128).expect("varint digit");
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if len == 0 {
            break;
        }
    }
    packet.extend_from_slice(body);
    stream.write_all(&packet)
}

/// Accept one client, hold CONNACK back for `connack_delay`, then grant its
/// SUBSCRIBE. Returns the live session stream.
pub fn accept_session(listener: &TcpListener, connack_delay: Duration) -> io::Result<TcpStream> {
    let (mut stream, _) = listener.accept()?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;

    let (header, _) = read_packet(&mut stream)?;
    assert_eq!(header >> 4, CONNECT, "expected CONNECT");
    thread::sleep(connack_delay);
    write_packet(&mut stream, 0x20, &[0x00, 0x00])?;

    let (header, body) = read_packet(&mut stream)?;
    assert_eq!(header >> 4, SUBSCRIBE, "expected SUBSCRIBE");
    let mut suback = body[..2].to_vec();
    let mut at = 2;
    while at + 2 <= body.len() {
        let filter_len = usize::from(u16::from_be_bytes([body[at], body[at + 1]]));
        at += 2 + filter_len + 1;
        suback.push(0x00);
    }
    write_packet(&mut stream, 0x90, &suback)?;
    Ok(stream)
}

/// QoS 0 PUBLISH.
pub fn send_publish(stream: &mut TcpStream, topic: &str, payload: &[u8]) -> io::Result<()> {
    let topic_len = u16::try_from(topic.len()).expect("topic length");
    let mut body = topic_len.to_be_bytes().to_vec();
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);
    write_packet(stream, 0x30, &body)
}

/// Keep the session open until the client disconnects or goes away.
pub fn hold_until_disconnect(stream: &mut TcpStream) {
    while let Ok((header, _)) = read_packet(stream) {
        if header >> 4 == DISCONNECT {
            break;
        }
    }
}
