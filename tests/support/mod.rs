//! Scripted in-process daemon for exercising the client end to end.
//!
//! Each test accepts a connection, performs the server side of the
//! greeting handshake, then answers operations with canned replies.

#![allow(dead_code)]

use nix_daemon_client::protocol::messages::Msg;
use nix_daemon_client::protocol::{
    OpCode, ProtocolVersion, CLIENT_PROTOCOL_VERSION, WORKER_MAGIC_1, WORKER_MAGIC_2,
};
use nix_daemon_client::serialization::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};

pub struct TestSocket {
    pub path: PathBuf,
    pub listener: UnixListener,
    // Held so the socket directory outlives the test.
    _dir: TempDir,
}

pub fn bind_socket() -> TestSocket {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&path).unwrap();
    TestSocket {
        path,
        listener,
        _dir: dir,
    }
}

// The primitive wire layout does not depend on the negotiated
// version, so the helpers below use the client's own.
const CODEC: ProtocolVersion = CLIENT_PROTOCOL_VERSION;

pub async fn read_u64(stream: &mut UnixStream) -> u64 {
    u64::deserialize(stream, CODEC).await.unwrap()
}

pub async fn read_string(stream: &mut UnixStream) -> String {
    String::deserialize(stream, CODEC).await.unwrap()
}

pub async fn read_bytes(stream: &mut UnixStream) -> Vec<u8> {
    Vec::<u8>::deserialize(stream, CODEC).await.unwrap()
}

/// Read an operation code, or `None` once the client hung up.
pub async fn try_read_u64(stream: &mut UnixStream) -> Option<u64> {
    let mut buf = [0u8; 8];
    match tokio::io::AsyncReadExt::read_exact(stream, &mut buf).await {
        Ok(_) => Some(u64::from_le_bytes(buf)),
        Err(_) => None,
    }
}

pub async fn read_string_list(stream: &mut UnixStream) -> Vec<String> {
    Vec::<String>::deserialize(stream, CODEC).await.unwrap()
}

pub async fn write_u64(stream: &mut UnixStream, value: u64) {
    value.serialize(stream, CODEC).await.unwrap();
}

pub async fn write_string(stream: &mut UnixStream, value: &str) {
    value.serialize(stream, CODEC).await.unwrap();
}

pub async fn write_string_list(stream: &mut UnixStream, values: &[&str]) {
    write_u64(stream, values.len() as u64).await;
    for value in values {
        write_string(stream, value).await;
    }
}

pub async fn expect_op(stream: &mut UnixStream, op: OpCode) {
    let raw = read_u64(stream).await;
    assert_eq!(raw, op as u64, "unexpected operation code {raw}");
}

pub async fn send_last(stream: &mut UnixStream) {
    write_u64(stream, Msg::Last as u64).await;
}

pub async fn send_next(stream: &mut UnixStream, line: &str) {
    write_u64(stream, Msg::Next as u64).await;
    write_string(stream, line).await;
}

pub async fn send_start_activity(stream: &mut UnixStream, id: u64, text: &str) {
    write_u64(stream, Msg::StartActivity as u64).await;
    write_u64(stream, id).await;
    write_u64(stream, 3).await; // level
    write_u64(stream, 100).await; // activity type
    write_string(stream, text).await;
    write_u64(stream, 0).await; // no fields
    write_u64(stream, 0).await; // no parent
}

pub async fn send_stop_activity(stream: &mut UnixStream, id: u64) {
    write_u64(stream, Msg::StopActivity as u64).await;
    write_u64(stream, id).await;
}

pub async fn send_error(stream: &mut UnixStream, version: ProtocolVersion, message: &str) {
    write_u64(stream, Msg::Error as u64).await;
    if version.minor >= 26 {
        write_string(stream, "Error").await;
        write_u64(stream, 0).await; // level
        write_string(stream, "Error").await;
        write_string(stream, message).await;
        write_u64(stream, 0).await; // have_pos
        write_u64(stream, 0).await; // no traces
    } else {
        write_string(stream, message).await;
        write_u64(stream, 1).await; // status
    }
}

/// The settings pushed by the client right after the handshake.
#[derive(Debug)]
pub struct CapturedOptions {
    pub keep_failed: u64,
    pub keep_going: u64,
    pub try_fallback: u64,
    pub verbosity: u64,
    pub max_build_jobs: u64,
    pub max_silent_time: u64,
    pub build_cores: u64,
    pub use_substitutes: u64,
    pub overrides: BTreeMap<String, String>,
}

/// Server side of the greeting handshake, including consuming the
/// client's `set_options` request.
pub async fn server_handshake(
    stream: &mut UnixStream,
    version: ProtocolVersion,
    nix_version: &str,
    trust: u64,
) -> CapturedOptions {
    let magic = read_u64(stream).await;
    assert_eq!(magic, WORKER_MAGIC_1);
    write_u64(stream, WORKER_MAGIC_2).await;
    write_u64(stream, u64::from(version)).await;

    let client_version = ProtocolVersion::from(read_u64(stream).await);
    assert_eq!(client_version.major, 1);
    let _cpu_affinity = read_u64(stream).await;
    let _reserve_space = read_u64(stream).await;

    if version.minor >= 33 {
        write_string(stream, nix_version).await;
    }
    if version.minor >= 35 {
        write_u64(stream, trust).await;
    }
    send_last(stream).await;

    consume_set_options(stream).await
}

pub async fn consume_set_options(stream: &mut UnixStream) -> CapturedOptions {
    expect_op(stream, OpCode::SetOptions).await;

    let keep_failed = read_u64(stream).await;
    let keep_going = read_u64(stream).await;
    let try_fallback = read_u64(stream).await;
    let verbosity = read_u64(stream).await;
    let max_build_jobs = read_u64(stream).await;
    let max_silent_time = read_u64(stream).await;
    let _use_build_hook = read_u64(stream).await;
    let _build_verbosity = read_u64(stream).await;
    let _obsolete_log_type = read_u64(stream).await;
    let _obsolete_print_build_trace = read_u64(stream).await;
    let build_cores = read_u64(stream).await;
    let use_substitutes = read_u64(stream).await;

    let mut overrides = BTreeMap::new();
    let count = read_u64(stream).await;
    for _ in 0..count {
        let name = read_string(stream).await;
        let value = read_string(stream).await;
        overrides.insert(name, value);
    }
    send_last(stream).await;

    CapturedOptions {
        keep_failed,
        keep_going,
        try_fallback,
        verbosity,
        max_build_jobs,
        max_silent_time,
        build_cores,
        use_substitutes,
        overrides,
    }
}

/// Read a framed payload up to and including the zero-length
/// terminator.
pub async fn read_framed(stream: &mut UnixStream) -> Vec<u8> {
    let mut payload = Vec::new();
    loop {
        let len = read_u64(stream).await;
        if len == 0 {
            return payload;
        }
        let mut chunk = vec![0u8; len as usize];
        tokio::io::AsyncReadExt::read_exact(stream, &mut chunk)
            .await
            .unwrap();
        payload.extend_from_slice(&chunk);
    }
}

/// Drain whatever the client still sends until it closes the stream.
pub async fn read_to_eof(stream: &mut UnixStream) {
    let mut buf = [0u8; 4096];
    loop {
        match tokio::io::AsyncReadExt::read(stream, &mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

pub async fn shutdown(mut stream: UnixStream) {
    let _ = stream.shutdown().await;
}
