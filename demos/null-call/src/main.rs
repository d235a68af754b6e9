//! NULL procedure call against an ONC RPC server.
//!
//! Usage: `null-call [host] [port] [program] [version]`
//!
//! Defaults to the NFSv3 program on `127.0.0.1:2049`. Set `RUST_LOG=debug`
//! to watch the connection lifecycle.

use std::process::ExitCode;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use nfsrpc::{ConnectionRegistry, Endpoint, RegistryConfig, RpcRequest};
use tracing_subscriber::EnvFilter;

const NFS_PROGRAM: u32 = 100_003;
const NFS_V3: u32 = 3;

const MSG_CALL: u32 = 0;
const RPC_VERSION: u32 = 2;
const AUTH_NONE: u32 = 0;

/// Encode a call to procedure 0 with AUTH_NONE credentials.
fn null_call(xid: u32, program: u32, version: u32) -> RpcRequest {
    let mut call = BytesMut::with_capacity(40);
    call.put_u32(xid);
    call.put_u32(MSG_CALL);
    call.put_u32(RPC_VERSION);
    call.put_u32(program);
    call.put_u32(version);
    call.put_u32(0);
    // cred and verf: flavor, zero-length body
    for _ in 0..2 {
        call.put_u32(AUTH_NONE);
        call.put_u32(0);
    }
    RpcRequest::new(xid, call.freeze())
}

/// Return `(reply_stat, accept_stat)` from a reply header.
fn reply_status(mut reply: &[u8]) -> Option<(u32, Option<u32>)> {
    if reply.len() < 12 {
        return None;
    }
    let _xid = reply.get_u32();
    let _msg_type = reply.get_u32();
    let reply_stat = reply.get_u32();
    if reply_stat != 0 || reply.len() < 8 {
        return Some((reply_stat, None));
    }

    let _verf_flavor = reply.get_u32();
    let verf_len = reply.get_u32() as usize;
    let padded = verf_len.div_ceil(4) * 4;
    if reply.len() < padded + 4 {
        return Some((reply_stat, None));
    }
    reply.advance(padded);
    Some((reply_stat, Some(reply.get_u32())))
}

fn arg<T: std::str::FromStr>(args: &[String], index: usize, default: T) -> Result<T, String> {
    match args.get(index) {
        Some(raw) => raw.parse().map_err(|_| format!("invalid argument: {raw}")),
        None => Ok(default),
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let host = args.first().cloned().unwrap_or_else(|| "127.0.0.1".to_owned());
    let port = arg(&args, 1, 2049u16)?;
    let program = arg(&args, 2, NFS_PROGRAM)?;
    let version = arg(&args, 3, NFS_V3)?;

    let registry = ConnectionRegistry::new(RegistryConfig::new().io_threads(1))?;
    let endpoint = Endpoint::new(host, port);

    for xid in 1..=3u32 {
        let request = null_call(xid, program, version);
        let started = std::time::Instant::now();
        let reply = registry.send_and_wait_blocking(&endpoint, false, &request, Duration::from_secs(5))?;

        match reply_status(reply.payload()) {
            Some((0, Some(0))) => println!(
                "xid {xid}: NULL succeeded in {:?} ({} byte reply)",
                started.elapsed(),
                reply.payload().len()
            ),
            Some((reply_stat, accept_stat)) => println!(
                "xid {xid}: reply_stat {reply_stat}, accept_stat {accept_stat:?}"
            ),
            None => println!("xid {xid}: short reply of {} bytes", reply.payload().len()),
        }
    }

    if let Some(mean) = registry.call_metric().get_and_reset() {
        println!("mean latency: {mean:?}");
    }
    registry.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "null call failed");
            ExitCode::FAILURE
        }
    }
}
