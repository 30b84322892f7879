mod common;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tempfile::tempdir;

use common::*;
use quantum_gateway::dispatcher::Dispatched;
use quantum_gateway::jobs::{Job, JobStatus};
use quantum_gateway::sandbox::StreamKind;
use quantum_gateway::Gateway;

fn can_run_python() -> bool {
    if !process_sandbox_supported() || !python3_available() {
        eprintln!("skipping: process sandbox or python3 unavailable");
        return false;
    }
    true
}

fn run_to_completion(gateway: &Gateway, kind: &str, manifest: Value) -> Result<Job> {
    let doc = json!({"type": kind, "originator": ALICE, "manifest": manifest});
    let job = match submit(gateway, ALICE, "POST", "/intents", &doc, None)? {
        Dispatched::Accepted(job) => job,
        _ => return Err(anyhow!("expected an accepted job")),
    };
    assert_eq!(job.status, JobStatus::Queued);
    wait_for_job(gateway, &job.job_id, Duration::from_secs(30))
        .ok_or_else(|| anyhow!("job {} did not finish", job.job_id))
}

#[test]
fn run_code_prints_and_completes() -> Result<()> {
    if !can_run_python() {
        return Ok(());
    }
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let job = run_to_completion(
        &gateway,
        "runCode",
        json!({"version": "v1", "code": "print(1+1)", "timeout_seconds": 10}),
    )?;
    assert_eq!(job.status, JobStatus::Completed, "{job:?}");
    let result = job.result.ok_or_else(|| anyhow!("missing result"))?;
    assert_eq!(result.stdout, "2\n");
    assert_eq!(result.exit_code, Some(0));
    assert!(job.started_at.is_some() && job.completed_at.is_some());
    Ok(())
}

#[test]
fn infinite_loop_times_out_within_bounds() -> Result<()> {
    if !can_run_python() {
        return Ok(());
    }
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let cpu_limit = gateway.sandbox().config().cpu_limit;
    assert_eq!(cpu_limit, quantum_gateway::sandbox::DEFAULT_CPU_LIMIT);
    // A sleeping child stays in the unit's process group after the parent
    // starts spinning; both must be gone once the timeout fires.
    let code = "import os, time\n\
                if os.fork() == 0:\n    time.sleep(60)\n    os._exit(0)\n\
                print(os.getpgid(0), flush=True)\n\
                while True:\n    pass";
    let started = Instant::now();
    let job = run_to_completion(
        &gateway,
        "runCode",
        json!({"version": "v1", "code": code, "timeout_seconds": 3}),
    )?;
    let elapsed = started.elapsed();
    assert_eq!(job.status, JobStatus::TimedOut, "{job:?}");
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(15), "took {elapsed:?}");
    let result = job.result.ok_or_else(|| anyhow!("missing result"))?;
    assert_eq!(result.exit_code, None);
    assert_eq!(
        gateway.sandbox().available_slots(),
        gateway.sandbox().config().max_concurrent
    );

    let pgid: u32 = result
        .stdout
        .trim()
        .parse()
        .map_err(|err| anyhow!("no process group in {:?}: {err}", result.stdout))?;
    let survivors = wait_for_empty_group(pgid, Duration::from_secs(2));
    assert!(survivors.is_empty(), "group {pgid} still has {survivors:?}");
    Ok(())
}

#[test]
fn writes_outside_the_work_dir_are_refused() -> Result<()> {
    if !process_sandbox_supported() {
        return Ok(());
    }
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let planted = dir.path().join("artifacts").join("planted.bin");
    let command = format!(
        "echo pwned > '{}' || exit 9; echo unreachable",
        planted.display()
    );
    let job = run_to_completion(
        &gateway,
        "runCommand",
        json!({"version": "v1", "command": command, "timeout_seconds": 5}),
    )?;
    assert_eq!(job.status, JobStatus::Failed, "{job:?}");
    let result = job.result.ok_or_else(|| anyhow!("missing result"))?;
    assert_eq!(result.exit_code, Some(9));
    assert!(!planted.exists());

    if landlock_abi().is_none() {
        return Ok(());
    }
    let job = run_to_completion(
        &gateway,
        "runCommand",
        json!({"version": "v1", "command": "echo quiet > /dev/null && echo ok"}),
    )?;
    assert_eq!(job.status, JobStatus::Completed, "{job:?}");
    Ok(())
}

#[test]
fn work_dir_stays_writable_under_landlock() -> Result<()> {
    if !process_sandbox_supported() || landlock_abi().is_none() {
        eprintln!("skipping: landlock unavailable");
        return Ok(());
    }
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let job = run_to_completion(
        &gateway,
        "runCommand",
        json!({
            "version": "v1",
            "command": "echo scratch > notes.txt && mkdir sub && cat notes.txt && \
                        t=$(mktemp) && echo tmp > \"$t\" && cat \"$t\"",
            "timeout_seconds": 5
        }),
    )?;
    assert_eq!(job.status, JobStatus::Completed, "{job:?}");
    let result = job.result.ok_or_else(|| anyhow!("missing result"))?;
    assert_eq!(result.stdout, "scratch\ntmp\n");
    Ok(())
}

#[test]
fn failing_code_reports_stderr_and_exit_code() -> Result<()> {
    if !can_run_python() {
        return Ok(());
    }
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let job = run_to_completion(
        &gateway,
        "runCode",
        json!({
            "version": "v1",
            "code": "import os, sys\nsys.stderr.write(os.environ['GREETING'])\nsys.exit(4)",
            "environment": {"GREETING": "hello"}
        }),
    )?;
    assert_eq!(job.status, JobStatus::Failed);
    let result = job.result.ok_or_else(|| anyhow!("missing result"))?;
    assert_eq!(result.exit_code, Some(4));
    assert_eq!(result.stderr, "hello");
    Ok(())
}

#[test]
fn run_command_uses_the_shell() -> Result<()> {
    if !process_sandbox_supported() {
        return Ok(());
    }
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let job = run_to_completion(
        &gateway,
        "runCommand",
        json!({
            "version": "v1",
            "command": "echo one; echo two | tr a-z A-Z",
            "timeout_seconds": 5
        }),
    )?;
    assert_eq!(job.status, JobStatus::Completed, "{job:?}");
    let result = job.result.ok_or_else(|| anyhow!("missing result"))?;
    assert_eq!(result.stdout, "one\nTWO\n");
    Ok(())
}

#[test]
fn network_access_is_blocked() -> Result<()> {
    if !can_run_python() {
        return Ok(());
    }
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let code = "import socket\ntry:\n    socket.socket(socket.AF_INET, socket.SOCK_STREAM)\n    print('open')\nexcept OSError:\n    print('blocked')";
    let job = run_to_completion(
        &gateway,
        "runCode",
        json!({"version": "v1", "code": code, "timeout_seconds": 10}),
    )?;
    let result = job.result.ok_or_else(|| anyhow!("missing result"))?;
    assert_eq!(result.stdout, "blocked\n", "{:?}", result.stderr);
    Ok(())
}

#[test]
fn streaming_run_yields_lines_then_records_the_job() -> Result<()> {
    if !can_run_python() {
        return Ok(());
    }
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let doc = json!({
        "type": "runCode",
        "originator": ALICE,
        "manifest": {
            "version": "v1",
            "code": "import sys\nfor i in range(3):\n    print(i)\nsys.stderr.write('done\\n')",
            "stream_logs": true
        }
    });
    let Dispatched::Stream(mut stream) = submit(&gateway, ALICE, "POST", "/intents", &doc, None)?
    else {
        return Err(anyhow!("expected a log stream"));
    };
    let job_id = stream.job_id();
    assert_eq!(
        gateway.jobs().get(&job_id).map(|job| job.status),
        Some(JobStatus::Running)
    );

    let events: Vec<_> = stream.by_ref().collect();
    let stdout: Vec<&str> = events
        .iter()
        .filter(|event| event.stream == StreamKind::Stdout)
        .map(|event| event.line.as_str())
        .collect();
    assert_eq!(stdout, vec!["0", "1", "2"]);
    assert!(events
        .iter()
        .any(|event| event.stream == StreamKind::Stderr && event.line == "done"));

    let job = stream.finish()?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(gateway.job_status(ALICE, &job_id)?.status, JobStatus::Completed);
    Ok(())
}

#[test]
fn job_status_is_private_to_the_originator() -> Result<()> {
    if !process_sandbox_supported() {
        return Ok(());
    }
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let job = run_to_completion(
        &gateway,
        "runCommand",
        json!({"version": "v1", "command": "true"}),
    )?;

    let doc = json!({
        "type": "jobStatus",
        "originator": ALICE,
        "manifest": {"version": "v1", "job_id": job.job_id}
    });
    let Dispatched::Job(seen) = submit(&gateway, ALICE, "POST", "/intents", &doc, None)? else {
        return Err(anyhow!("expected a job"));
    };
    assert_eq!(seen.job_id, job.job_id);

    let doc = json!({
        "type": "jobStatus",
        "originator": BOB,
        "manifest": {"version": "v1", "job_id": job.job_id}
    });
    let err = match submit(&gateway, BOB, "POST", "/intents", &doc, None) {
        Err(err) => err,
        Ok(_) => return Err(anyhow!("bob saw alice's job")),
    };
    assert_eq!(err.status(), 403);

    let err = match gateway.job_status(ALICE, &uuid::Uuid::new_v4()) {
        Err(err) => err,
        Ok(_) => return Err(anyhow!("unknown job found")),
    };
    assert_eq!(err.status(), 404);
    Ok(())
}
