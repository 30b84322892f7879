#![allow(dead_code)]

use anyhow::Result;
use serde_json::Value;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use quantum_gateway::auth::{sign_request, SecretEntry, SignedRequest, SigningVersion};
use quantum_gateway::dispatcher::Dispatched;
use quantum_gateway::jobs::Job;
use quantum_gateway::{now_ms, Gateway, GatewayConfig, GatewayError};

pub const ALICE: &str = "rs_alice";
pub const BOB: &str = "rs_bob";
pub const ALICE_SECRET: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
pub const BOB_SECRET: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100";
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn schema_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("schemas")
}

pub fn test_config(dir: &Path) -> Result<GatewayConfig> {
    let mut cfg = GatewayConfig::default();
    cfg.db_path = dir.join("gateway.db").to_string_lossy().into_owned();
    cfg.api_addr = "127.0.0.1:0".to_string();
    cfg.schema_dir = schema_dir();
    cfg.storage_dir = dir.join("artifacts");
    cfg.auth.rate_limits.per_originator = 10_000;
    cfg.auth.rate_limits.per_ip = 10_000;
    cfg.secrets = vec![
        SecretEntry::from_hex(ALICE, "v1", ALICE_SECRET)?,
        SecretEntry::from_hex(BOB, "v1", BOB_SECRET)?,
    ];
    Ok(cfg)
}

pub fn open_gateway(dir: &Path) -> Result<Arc<Gateway>> {
    Gateway::open(test_config(dir)?)
}

pub fn secret_for(originator: &str) -> Vec<u8> {
    let hex_secret = if originator == BOB { BOB_SECRET } else { ALICE_SECRET };
    hex::decode(hex_secret).unwrap_or_default()
}

pub fn fresh_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Authorization header for `document`, signed now with the originator's
/// `v1` key.
pub fn authorization(originator: &str, method: &str, path: &str, document: &[u8]) -> String {
    sign_request(
        &secret_for(originator),
        SigningVersion::V1,
        method,
        path,
        now_ms() as i64,
        &fresh_nonce(),
        document,
    )
}

/// Signs and submits `document` as `originator`.
pub fn submit(
    gateway: &Gateway,
    originator: &str,
    method: &str,
    path: &str,
    document: &Value,
    body: Option<&mut dyn Read>,
) -> Result<Dispatched, GatewayError> {
    let raw = document.to_string().into_bytes();
    let header = authorization(originator, method, path, &raw);
    gateway.submit(
        &SignedRequest {
            method,
            path,
            authorization: Some(&header),
            key_version: None,
            document: &raw,
            client_ip: LOCALHOST,
        },
        body,
    )
}

pub fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("-c")
        .arg("0")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

pub fn process_sandbox_supported() -> bool {
    cfg!(all(target_os = "linux", target_arch = "x86_64"))
}

/// Landlock ABI of the running kernel; `None` means units fall back to the
/// seccomp write filter and cannot write anywhere.
pub fn landlock_abi() -> Option<i32> {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        quantum_gateway::sandbox::landlock::abi_version()
    }
    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        None
    }
}

/// Live (non-zombie) processes whose process group is `pgid`, from
/// `/proc/<pid>/stat`.
pub fn live_group_members(pgid: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| {
            let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
                return false;
            };
            // The command name may contain spaces; fields resume after its ')'.
            let Some((_, rest)) = stat.rsplit_once(')') else {
                return false;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            let (state, pgrp) = (fields.first().copied(), fields.get(2).copied());
            state != Some("Z") && pgrp.and_then(|pgrp| pgrp.parse::<u32>().ok()) == Some(pgid)
        })
        .collect()
}

/// Waits up to `limit` for the process group to empty out.
pub fn wait_for_empty_group(pgid: u32, limit: Duration) -> Vec<u32> {
    let deadline = Instant::now() + limit;
    loop {
        let members = live_group_members(pgid);
        if members.is_empty() || Instant::now() >= deadline {
            return members;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Polls the job table until the job reaches a terminal state.
pub fn wait_for_job(gateway: &Gateway, job_id: &Uuid, limit: Duration) -> Option<Job> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Some(job) = gateway.jobs().get(job_id) {
            if job.status.is_terminal() {
                return Some(job);
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}
