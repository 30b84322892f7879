mod common;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::io::{self, Read};
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

use common::*;
use quantum_gateway::artifact::{ArtifactMetadata, ArtifactReceipt, StorageError};
use quantum_gateway::dispatcher::Dispatched;
use quantum_gateway::{sha256_hex, Gateway, GatewayError, SYSTEM_ORIGINATOR};

/// Stores `body`, pinning its size and digest in the manifest unless the
/// caller declared them.
fn store(
    gateway: &Gateway,
    originator: &str,
    mut manifest: Value,
    body: &[u8],
) -> Result<ArtifactReceipt, GatewayError> {
    if let Some(fields) = manifest.as_object_mut() {
        fields
            .entry("expected_size")
            .or_insert_with(|| json!(body.len()));
        fields
            .entry("expected_sha256")
            .or_insert_with(|| json!(sha256_hex(body)));
    }
    store_raw(gateway, originator, manifest, body)
}

fn store_raw(
    gateway: &Gateway,
    originator: &str,
    manifest: Value,
    mut body: impl Read,
) -> Result<ArtifactReceipt, GatewayError> {
    let doc = json!({"type": "storeArtifact", "originator": originator, "manifest": manifest});
    match submit(gateway, originator, "POST", "/artifacts", &doc, Some(&mut body))? {
        Dispatched::Stored(receipt) => Ok(receipt),
        _ => Err(GatewayError::Internal("unexpected dispatch".to_string())),
    }
}

fn retrieve(
    gateway: &Gateway,
    originator: &str,
    artifact_id: &Uuid,
) -> Result<(ArtifactMetadata, Vec<u8>), GatewayError> {
    let doc = json!({
        "type": "retrieveArtifact",
        "originator": originator,
        "manifest": {"version": "v1", "artifact_id": artifact_id}
    });
    match submit(gateway, originator, "POST", "/intents", &doc, None)? {
        Dispatched::Artifact { meta, mut reader } => {
            let mut bytes = Vec::new();
            reader
                .read_to_end(&mut bytes)
                .map_err(|err| GatewayError::Internal(err.to_string()))?;
            Ok((meta, bytes))
        }
        _ => Err(GatewayError::Internal("unexpected dispatch".to_string())),
    }
}

fn simple(
    gateway: &Gateway,
    originator: &str,
    kind: &str,
    manifest: Value,
) -> Result<Dispatched, GatewayError> {
    let doc = json!({"type": kind, "originator": originator, "manifest": manifest});
    submit(gateway, originator, "POST", "/intents", &doc, None)
}

fn storage_err(err: &GatewayError) -> Option<&StorageError> {
    match err {
        GatewayError::Storage(inner) => Some(inner),
        _ => None,
    }
}

#[test]
fn upload_then_download_returns_identical_bytes() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let payload = b"quantum circuit results".to_vec();
    let receipt = store(
        &gateway,
        ALICE,
        json!({
            "version": "v1",
            "mime_type": "text/plain",
            "tags": {"run": "42"},
            "expected_size": payload.len(),
            "expected_sha256": sha256_hex(&payload)
        }),
        payload.as_slice(),
    )?;
    assert_eq!(receipt.size_bytes, payload.len() as u64);
    assert_eq!(receipt.content_hash, sha256_hex(&payload));
    assert!(!receipt.replaced);

    let (meta, bytes) = retrieve(&gateway, ALICE, &receipt.artifact_id)?;
    assert_eq!(bytes, payload);
    assert_eq!(meta.originator, ALICE);
    assert_eq!(meta.mime_type.as_deref(), Some("text/plain"));
    assert_eq!(meta.content_hash, receipt.content_hash);

    let trail = gateway.artifacts().ledger().audit_trail(&receipt.artifact_id)?;
    assert!(!trail.is_empty());
    Ok(())
}

#[test]
fn declared_hash_or_size_mismatch_leaves_nothing_behind() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let id = Uuid::new_v4();

    let err = store(
        &gateway,
        ALICE,
        json!({"version": "v1", "artifact_id": id, "expected_sha256": sha256_hex(b"other")}),
        &b"payload"[..],
    )
    .unwrap_err();
    assert!(matches!(storage_err(&err), Some(StorageError::HashMismatch { .. })));
    assert_eq!(err.status(), 422);

    let err = store(
        &gateway,
        ALICE,
        json!({"version": "v1", "artifact_id": id, "expected_size": 3}),
        &b"payload"[..],
    )
    .unwrap_err();
    assert!(matches!(storage_err(&err), Some(StorageError::SizeMismatch { .. })));

    assert!(!gateway.artifacts().store().exists(&id));
    assert!(gateway.artifacts().ledger().get(&id)?.is_none());
    Ok(())
}

#[test]
fn swapped_body_under_a_valid_signature_is_refused() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let id = Uuid::new_v4();
    let original = b"measured amplitudes";
    let forged = b"attacker amplitudes";
    assert_eq!(original.len(), forged.len());

    let manifest = json!({
        "version": "v1",
        "artifact_id": id,
        "expected_size": original.len(),
        "expected_sha256": sha256_hex(original)
    });
    let err = store_raw(&gateway, ALICE, manifest, &forged[..]).unwrap_err();
    assert!(matches!(storage_err(&err), Some(StorageError::HashMismatch { .. })), "{err}");
    assert_eq!(err.code(), "hash_mismatch");
    assert!(!gateway.artifacts().store().exists(&id));

    // Without a pinned digest the document does not validate.
    let err = store_raw(&gateway, ALICE, json!({"version": "v1"}), &forged[..]).unwrap_err();
    assert_eq!(err.status(), 422);
    assert_eq!(err.path(), Some("/manifest"));
    assert_eq!(gateway.artifacts().ledger().count()?, 0);
    Ok(())
}

#[test]
fn concurrent_uploads_get_distinct_ids() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let gateway = Arc::clone(&gateway);
            std::thread::spawn(move || {
                let body = format!("payload {i}");
                store(&gateway, ALICE, json!({"version": "v1"}), body.as_bytes())
            })
        })
        .collect();
    let mut ids = Vec::new();
    for handle in handles {
        let receipt = handle.join().map_err(|_| anyhow!("upload thread panicked"))??;
        ids.push(receipt.artifact_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(gateway.artifacts().ledger().count()?, 8);
    Ok(())
}

#[test]
fn racing_uploads_to_one_id_produce_exactly_one_winner() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let id = Uuid::new_v4();
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let gateway = Arc::clone(&gateway);
            std::thread::spawn(move || {
                let body = vec![i as u8; 4096];
                store(&gateway, ALICE, json!({"version": "v1", "artifact_id": id}), body.as_slice())
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.join().map_err(|_| anyhow!("upload thread panicked"))? {
            Ok(receipt) => winners.push(receipt),
            Err(err) => {
                assert!(matches!(storage_err(&err), Some(StorageError::Conflict(_))), "{err}");
                assert_eq!(err.status(), 409);
                conflicts += 1;
            }
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 5);

    let (meta, bytes) = retrieve(&gateway, ALICE, &id)?;
    assert_eq!(meta.content_hash, winners[0].content_hash);
    assert_eq!(sha256_hex(&bytes), winners[0].content_hash);
    Ok(())
}

#[test]
fn oversized_upload_is_rejected_without_residue() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let id = Uuid::new_v4();
    let limit = gateway.artifacts().limits().max_artifact_bytes;
    let body = io::repeat(0xAB).take(limit + 1024 * 1024);

    // The declared size is small; the stream itself has to be cut off.
    let manifest = json!({
        "version": "v1",
        "artifact_id": id,
        "expected_size": 10,
        "expected_sha256": "0".repeat(64)
    });
    let err = store_raw(&gateway, ALICE, manifest, body).unwrap_err();
    assert!(matches!(storage_err(&err), Some(StorageError::TooLarge { .. })), "{err}");
    assert_eq!(err.status(), 413);
    assert!(!gateway.artifacts().store().exists(&id));
    assert!(gateway.artifacts().ledger().get(&id)?.is_none());
    assert_eq!(gateway.artifacts().ledger().count()?, 0);
    Ok(())
}

#[test]
fn replace_requires_the_flag_and_write_access() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let receipt = store(
        &gateway,
        ALICE,
        json!({"version": "v1", "tags": {"stage": "draft"}}),
        &b"first"[..],
    )?;
    let id = receipt.artifact_id;

    let err = store(&gateway, ALICE, json!({"version": "v1", "artifact_id": id}), &b"second"[..])
        .unwrap_err();
    assert_eq!(err.status(), 409);

    let err = store(
        &gateway,
        BOB,
        json!({"version": "v1", "artifact_id": id, "replace": true}),
        &b"hijack"[..],
    )
    .unwrap_err();
    assert_eq!(err.status(), 403);

    let replaced = store(
        &gateway,
        ALICE,
        json!({"version": "v1", "artifact_id": id, "replace": true}),
        &b"second"[..],
    )?;
    assert!(replaced.replaced);
    let (meta, bytes) = retrieve(&gateway, ALICE, &id)?;
    assert_eq!(bytes, b"second");
    assert_eq!(meta.version, 2);
    assert_eq!(meta.tags.get("stage"), Some(&json!("draft")));
    Ok(())
}

#[test]
fn access_control_governs_reads_updates_and_deletes() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let private = store(&gateway, ALICE, json!({"version": "v1"}), &b"secret"[..])?;
    let shared = store(
        &gateway,
        ALICE,
        json!({"version": "v1", "access_control": {"read": [BOB]}}),
        &b"shared"[..],
    )?;

    let err = retrieve(&gateway, BOB, &private.artifact_id).unwrap_err();
    assert!(matches!(storage_err(&err), Some(StorageError::AccessDenied(_))));
    assert_eq!(err.status(), 403);

    let (_, bytes) = retrieve(&gateway, BOB, &shared.artifact_id)?;
    assert_eq!(bytes, b"shared");

    // Read access does not grant write.
    let err = match simple(
        &gateway,
        BOB,
        "deleteArtifact",
        json!({"version": "v1", "artifact_id": shared.artifact_id}),
    ) {
        Err(err) => err,
        Ok(_) => panic!("reader deleted artifact"),
    };
    assert_eq!(err.status(), 403);

    let updated = simple(
        &gateway,
        ALICE,
        "updateArtifact",
        json!({"version": "v1", "artifact_id": shared.artifact_id, "tags": {"state": "final"}}),
    )?;
    let Dispatched::Updated(meta) = updated else {
        panic!("expected update result");
    };
    assert_eq!(meta.tags.get("state"), Some(&json!("final")));

    let missing = Uuid::new_v4();
    let err = retrieve(&gateway, ALICE, &missing).unwrap_err();
    assert_eq!(err.status(), 404);

    let deleted = simple(
        &gateway,
        ALICE,
        "deleteArtifact",
        json!({"version": "v1", "artifact_id": shared.artifact_id}),
    )?;
    assert!(matches!(deleted, Dispatched::Deleted(id) if id == shared.artifact_id));
    let err = match simple(
        &gateway,
        ALICE,
        "deleteArtifact",
        json!({"version": "v1", "artifact_id": shared.artifact_id}),
    ) {
        Err(err) => err,
        Ok(_) => panic!("second delete succeeded"),
    };
    assert_eq!(err.status(), 404);
    assert!(!gateway.artifacts().store().exists(&shared.artifact_id));
    Ok(())
}

#[test]
fn expired_artifacts_are_gone_and_swept() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    let receipt = store(&gateway, ALICE, json!({"version": "v1"}), &b"short lived"[..])?;
    let id = receipt.artifact_id;

    simple(
        &gateway,
        ALICE,
        "updateArtifact",
        json!({"version": "v1", "artifact_id": id, "expires_at": 1}),
    )?;

    let err = retrieve(&gateway, ALICE, &id).unwrap_err();
    assert!(matches!(storage_err(&err), Some(StorageError::Expired(_))));
    assert_eq!(err.status(), 410);

    // The owner check runs before expiry.
    let err = retrieve(&gateway, BOB, &id).unwrap_err();
    assert_eq!(err.status(), 403);

    let report = gateway.run_maintenance();
    assert_eq!(report.expired_artifacts, 1);
    assert!(gateway.artifacts().ledger().get(&id)?.is_none());
    assert!(!gateway.artifacts().store().exists(&id));
    assert_eq!(retrieve(&gateway, ALICE, &id).unwrap_err().status(), 404);
    Ok(())
}

#[test]
fn queries_only_list_readable_artifacts() -> Result<()> {
    let dir = tempdir()?;
    let gateway = open_gateway(dir.path())?;
    store(&gateway, ALICE, json!({"version": "v1", "mime_type": "text/plain"}), &b"a"[..])?;
    store(&gateway, ALICE, json!({"version": "v1", "mime_type": "application/json"}), &b"{}"[..])?;
    store(
        &gateway,
        ALICE,
        json!({"version": "v1", "access_control": {"read": [BOB]}}),
        &b"shared"[..],
    )?;
    store(&gateway, BOB, json!({"version": "v1"}), &b"bob's"[..])?;

    let page = |originator: &str, manifest: Value| -> Result<Vec<ArtifactMetadata>> {
        match simple(&gateway, originator, "queryArtifacts", manifest)? {
            Dispatched::Page(page) => Ok(page.artifacts),
            _ => Err(anyhow!("expected a page")),
        }
    };

    assert_eq!(page(ALICE, json!({"version": "v1"}))?.len(), 3);
    assert_eq!(page(BOB, json!({"version": "v1"}))?.len(), 2);
    let plain = page(ALICE, json!({"version": "v1", "mime_type": "text/plain"}))?;
    assert_eq!(plain.len(), 1);
    let sorted = page(
        ALICE,
        json!({"version": "v1", "sort_by": "size_bytes", "sort_order": "asc"}),
    )?;
    let sizes: Vec<u64> = sorted.iter().map(|meta| meta.size_bytes).collect();
    assert_eq!(sizes, vec![1, 2, 6]);
    assert_eq!(page(ALICE, json!({"version": "v1", "limit": 1, "offset": 1}))?.len(), 1);

    let all = gateway
        .artifacts()
        .query(SYSTEM_ORIGINATOR, &Default::default())?;
    assert_eq!(all.artifacts.len(), 4);
    Ok(())
}
