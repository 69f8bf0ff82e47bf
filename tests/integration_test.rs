//! End-to-end tests for file transfer, directory sync, and the device
//! server's auth/locking behavior, exercised against an in-memory stand-in
//! for a microcontroller rather than real hardware.
//!
//! `FakeMcu` drives the raw-REPL wire protocol on one end of a
//! `tokio::io::duplex` pipe well enough to answer the handful of remote
//! programs `fcopy`/`sync` actually send (`_mcu_write`, `_mcu_read`,
//! `_makedirs`, `os.stat`, `_mcu_list`), so `fput`/`fget`/`rdiff` run
//! against it exactly as they would against a real board.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex as AsyncMutex;

use iot_device::constants::{BUFFER_SIZE, MCU_ABORT, MCU_EOT, MCU_RAW_REPL, RAW_REPL_BANNER};
use iot_device::device::Device;
use iot_device::error::{IotError, Result};
use iot_device::registry::Registry;
use iot_device::repl::Session;
use iot_device::server::DeviceServer;
use iot_device::tls::server_tls_config;
use iot_device::transport::net::NetChannel;
use iot_device::transport::{ByteChannel, ChannelId};

// =============================================================================
// DuplexChannel - a ByteChannel backed by an in-memory pipe
// =============================================================================

/// `ByteChannel` over one end of a `tokio::io::duplex` pair, standing in
/// for `SerialChannel`/`NetChannel` so `Session`/`Device` can drive a
/// `FakeMcu` without any real I/O.
struct DuplexChannel {
    stream: DuplexStream,
    id: ChannelId,
}

#[async_trait]
impl ByteChannel for DuplexChannel {
    fn id(&self) -> ChannelId {
        self.id.clone()
    }

    async fn read(&mut self, n: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; n];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| IotError::TransportFailed { detail: e.to_string() })?;
        Ok(Bytes::from(buf))
    }

    async fn read_all(&mut self) -> Result<Bytes> {
        let mut buf = vec![0u8; 4096];
        match tokio::time::timeout(Duration::from_millis(30), self.stream.read(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) => Err(IotError::TransportFailed { detail: e.to_string() }),
            Err(_) => Ok(Bytes::new()),
        }
    }

    async fn read_until(&mut self, pattern: &[u8], timeout: Duration) -> Result<Bytes> {
        let mut buf = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if buf.len() >= pattern.len() && &buf[buf.len() - pattern.len()..] == pattern {
                return Ok(Bytes::from(buf));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(IotError::Timeout { waited: timeout });
            }
            let mut one = [0u8; 1];
            match tokio::time::timeout(Duration::from_millis(50), self.stream.read_exact(&mut one)).await {
                Ok(Ok(_)) => buf.push(one[0]),
                Ok(Err(e)) => return Err(IotError::TransportFailed { detail: e.to_string() }),
                Err(_) => continue,
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(|e| IotError::TransportFailed { detail: e.to_string() })
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

// =============================================================================
// FakeMcu - answers just enough of the raw-REPL protocol to back fcopy/sync
// =============================================================================

/// In-memory files the fake device "holds", keyed by the absolute path
/// `fput`/`fget` pass it.
type FakeFs = Arc<AsyncMutex<HashMap<String, Vec<u8>>>>;

fn first_quoted(s: &str) -> String {
    let start = s.find('\'').expect("expected a quoted python string literal");
    let rest = &s[start + 1..];
    let end = rest.find('\'').expect("unterminated python string literal");
    rest[..end].to_string()
}

fn call_args(line: &str, prefix: &str) -> Vec<String> {
    let start = line.find(prefix).expect("prefix not found in call line") + prefix.len();
    let rest = &line[start..];
    let end = rest.rfind(')').expect("unbalanced call line");
    rest[..end].split(',').map(|s| s.trim().to_string()).collect()
}

fn hex_decode(data: &[u8]) -> Vec<u8> {
    let s = std::str::from_utf8(data).expect("mcu_write payload is valid hex ascii");
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).expect("valid hex byte")).collect()
}

/// Read raw bytes off `stream` until the tail matches `pattern`, returning
/// everything read (including the pattern), or `None` on EOF.
async fn read_until_raw(stream: &mut DuplexStream, pattern: &[u8]) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut one = [0u8; 1];
    loop {
        if stream.read_exact(&mut one).await.is_err() {
            return None;
        }
        buf.push(one[0]);
        if buf.len() >= pattern.len() && &buf[buf.len() - pattern.len()..] == pattern {
            return Some(buf);
        }
    }
}

/// Drives one end of a duplex pipe as if it were a MicroPython board in
/// raw REPL mode, understanding exactly the handful of remote programs
/// `mcu_programs.rs` sends for `fput`, `fget`, `makedirs`, `file_size`,
/// and `rlist`/`rdiff`. Unknown programs get an empty-but-well-formed
/// reply so a test fails on a wrong assertion rather than hanging.
async fn run_fake_mcu(mut mcu: DuplexStream, fs: FakeFs, mcu_list: Option<&'static str>) {
    loop {
        if read_until_raw(&mut mcu, &[MCU_ABORT, MCU_ABORT, MCU_RAW_REPL]).await.is_none() {
            return;
        }
        if mcu.write_all(RAW_REPL_BANNER).await.is_err() {
            return;
        }

        let raw_source = match read_until_raw(&mut mcu, &[b'\r', MCU_EOT]).await {
            Some(b) => b,
            None => return,
        };
        if mcu.write_all(b"OK").await.is_err() {
            return;
        }
        let text = String::from_utf8_lossy(&raw_source[..raw_source.len() - 2]).into_owned();

        let mut stdout = Vec::new();

        if let Some(line) = text.lines().find(|l| l.trim_start().starts_with("output = _mcu_write(")) {
            let args = call_args(line, "_mcu_write(");
            let remote_file = args[0].trim_matches('\'').to_string();
            let filesize: u64 = args[1].parse().expect("filesize arg parses as u64");
            let binary = args[2] == "True";
            let wire_total = if binary { filesize * 2 } else { filesize };
            let mut received = Vec::with_capacity(wire_total as usize);
            let mut remaining = wire_total;
            while remaining > 0 {
                let chunk = remaining.min(BUFFER_SIZE as u64) as usize;
                let mut block = vec![0u8; chunk];
                if mcu.read_exact(&mut block).await.is_err() {
                    return;
                }
                received.extend_from_slice(&block);
                if mcu.write_all(&[0x06]).await.is_err() {
                    return;
                }
                remaining -= chunk as u64;
            }
            let data = if binary { hex_decode(&received) } else { received };
            fs.lock().await.insert(remote_file, data);
            stdout.extend_from_slice(b"True\n");
        } else if let Some(line) = text.lines().find(|l| l.trim_start().starts_with("_mcu_read(")) {
            let args = call_args(line, "_mcu_read(");
            let remote_file = args[0].trim_matches('\'').to_string();
            let filesize: u64 = args[1].parse().expect("filesize arg parses as u64");
            let data = fs.lock().await.get(&remote_file).cloned().unwrap_or_default();
            let mut offset = 0usize;
            let mut remaining = filesize;
            while remaining > 0 {
                let chunk = remaining.min(BUFFER_SIZE as u64) as usize;
                if mcu.write_all(&data[offset..offset + chunk]).await.is_err() {
                    return;
                }
                offset += chunk;
                let mut ack = [0u8; 1];
                if mcu.read_exact(&mut ack).await.is_err() {
                    return;
                }
                remaining -= chunk as u64;
            }
        } else if let Some(idx) = text.find("os.stat(") {
            let path = first_quoted(&text[idx..]);
            let size = fs.lock().await.get(&path).map(|d| d.len() as i64).unwrap_or(-1);
            stdout.extend_from_slice(format!("{size}\n").as_bytes());
        } else if text.lines().any(|l| l.trim_start().starts_with("output = _makedirs(")) {
            stdout.extend_from_slice(b"True\n");
        } else if text.lines().any(|l| l.trim_start().starts_with("_mcu_list(")) {
            if let Some(canned) = mcu_list {
                stdout.extend_from_slice(canned.as_bytes());
            }
        }

        if mcu.write_all(&stdout).await.is_err() {
            return;
        }
        if mcu.write_all(&[MCU_EOT, MCU_EOT]).await.is_err() {
            return;
        }
        if mcu.write_all(b">").await.is_err() {
            return;
        }
    }
}

fn fake_device(id: &str) -> (Arc<Device>, DuplexStream, FakeFs) {
    let (host_side, mcu_side) = tokio::io::duplex(8192);
    let channel = DuplexChannel { stream: host_side, id: ChannelId::Serial(id.to_string()) };
    let device = Arc::new(Device::new(format!("uid-{id}"), format!("fake mcu {id}"), Box::new(channel)));
    let fs = Arc::new(AsyncMutex::new(HashMap::new()));
    (device, mcu_side, fs)
}

// =============================================================================
// File transfer
// =============================================================================

#[tokio::test]
async fn fput_then_fget_round_trips_binary_payload() {
    let (device, mcu_side, fs) = fake_device("binary");
    tokio::spawn(run_fake_mcu(mcu_side, fs, None));

    let mut dsession = device.acquire().await;
    let mut session = Session::new(&mut dsession);

    let dir = tempfile::tempdir().unwrap();
    let local_in = dir.path().join("a.bin");
    let local_out = dir.path().join("b.bin");
    let payload: Vec<u8> = (0..1000u32).map(|i| (i * 37 % 256) as u8).collect();
    tokio::fs::write(&local_in, &payload).await.unwrap();

    assert!(session.fput(&local_in, "/data.bin").await.unwrap());
    assert!(session.fget("/data.bin", &local_out).await.unwrap());

    let roundtripped = tokio::fs::read(&local_out).await.unwrap();
    assert_eq!(roundtripped, payload);
}

#[tokio::test]
async fn fput_then_fget_round_trips_text_payload_not_needing_hex() {
    let (device, mcu_side, fs) = fake_device("text");
    tokio::spawn(run_fake_mcu(mcu_side, fs, None));

    let mut dsession = device.acquire().await;
    let mut session = Session::new(&mut dsession);

    let dir = tempfile::tempdir().unwrap();
    let local_in = dir.path().join("main.py");
    let local_out = dir.path().join("main_roundtrip.py");
    let payload = b"import machine\nprint('hello world')\n".repeat(20);
    tokio::fs::write(&local_in, &payload).await.unwrap();

    assert!(session.fput(&local_in, "/main.py").await.unwrap());
    assert!(session.fget("/main.py", &local_out).await.unwrap());

    let roundtripped = tokio::fs::read(&local_out).await.unwrap();
    assert_eq!(roundtripped, payload);
}

// =============================================================================
// Directory sync
// =============================================================================

const CANNED_MCU_LISTING: &str = " D,0,'',1690000000,0\n F,1,'foo.py',1690000000,3\n F,1,'quux.py',1690000000,10\n";

#[tokio::test]
async fn rdiff_computes_add_delete_update_against_a_three_way_mismatch() {
    let (device, mcu_side, fs) = fake_device("rdiff");
    tokio::spawn(run_fake_mcu(mcu_side, fs, Some(CANNED_MCU_LISTING)));

    let dir = tempfile::tempdir().unwrap();
    let project_root = dir.path().join("proj");
    std::fs::create_dir_all(project_root.join("bar")).unwrap();
    std::fs::write(project_root.join("foo.py"), b"print(1)\n").unwrap(); // 9 bytes, mcu says 3 -> update
    std::fs::write(project_root.join("bar").join("baz.py"), b"x = 1\n").unwrap(); // absent on mcu -> add

    let mut dsession = device.acquire().await;
    let mut session = Session::new(&mut dsession);
    let projects = vec!["proj".to_string()];

    let plan = session.rdiff(dir.path(), "/", &projects).await.unwrap();
    assert!(plan.to_add.contains_key("bar"));
    assert!(plan.to_add.contains_key("bar/baz.py"));
    assert_eq!(plan.to_delete, vec!["quux.py".to_string()]);
    assert!(plan.to_update.contains_key("foo.py"));

    // Idempotent: the same unchanged listing yields the same plan.
    let plan2 = session.rdiff(dir.path(), "/", &projects).await.unwrap();
    assert_eq!(plan.to_add, plan2.to_add);
    assert_eq!(plan.to_delete, plan2.to_delete);
    assert_eq!(plan.to_update, plan2.to_update);
}

#[tokio::test]
async fn rdiff_deletes_nested_paths_in_reverse_lexical_order() {
    const LISTING: &str = concat!(
        " D,0,'',1690000000,0\n",
        " D,1,'lib',1690000000,0\n",
        " F,2,'a.py',1690000000,1\n",
        " F,2,'z.py',1690000000,1\n",
        " F,1,'main.py',1690000000,1\n",
    );
    let (device, mcu_side, fs) = fake_device("rdiff-order");
    tokio::spawn(run_fake_mcu(mcu_side, fs, Some(LISTING)));

    // Empty host tree: everything the mcu reports should be deleted.
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("proj")).unwrap();

    let mut dsession = device.acquire().await;
    let mut session = Session::new(&mut dsession);
    let plan = session.rdiff(dir.path(), "/", &["proj".to_string()]).await.unwrap();

    // Children before their parent directory, reverse-sorted within a level.
    assert_eq!(plan.to_delete, vec!["main.py", "lib/z.py", "lib/a.py", "lib"]);
}

// =============================================================================
// Device server auth, locking, and concurrency
// =============================================================================

fn rcgen_cert() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.signing_key.serialize_pem()).unwrap();
    (dir, cert_path, key_path)
}

async fn spawn_test_server(password: &str, registry: Arc<Registry>) -> SocketAddr {
    let (_dir, cert_path, key_path) = rcgen_cert();
    let tls_config = server_tls_config(&cert_path, &key_path).unwrap();
    let server = Arc::new(DeviceServer::new(registry, password.to_string(), tls_config));

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let port = addr.port();
    tokio::spawn(server.run(port));
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

#[tokio::test]
async fn second_client_to_a_locked_device_is_rejected_as_busy() {
    let registry = Arc::new(Registry::new());
    let (device, mcu_side, fs) = fake_device("busy");
    tokio::spawn(run_fake_mcu(mcu_side, fs, None));
    registry.add(device);

    let addr = spawn_test_server("s3cret", registry).await;

    let _first = NetChannel::connect(addr, "uid-busy", "s3cret").await.unwrap();
    let second = NetChannel::connect(addr, "uid-busy", "s3cret").await;
    assert!(matches!(second, Err(IotError::AuthFailed { .. })));
}

#[tokio::test]
async fn distinct_devices_can_be_locked_concurrently() {
    let registry = Arc::new(Registry::new());
    let (device_a, mcu_a, fs_a) = fake_device("concurrent-a");
    let (device_b, mcu_b, fs_b) = fake_device("concurrent-b");
    tokio::spawn(run_fake_mcu(mcu_a, fs_a, None));
    tokio::spawn(run_fake_mcu(mcu_b, fs_b, None));
    registry.add(device_a);
    registry.add(device_b);

    let addr = spawn_test_server("s3cret", registry).await;

    let a = NetChannel::connect(addr, "uid-concurrent-a", "s3cret").await;
    let b = NetChannel::connect(addr, "uid-concurrent-b", "s3cret").await;
    assert!(a.is_ok());
    assert!(b.is_ok());
}
