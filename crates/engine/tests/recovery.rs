//! Crash recovery tests built from constructed crash states: transaction
//! contexts leaked mid-protocol (the moral equivalent of `kill -9`),
//! orphaned checkpoint artifacts, and hand-written pending markers.

use std::fs;
use std::path::Path;

use cairn_core::bytes::u64_be;
use cairn_core::{DatabaseFlags, Error};
use cairn_engine::store::{Env, EnvOptions};
use cairn_engine::vector::{AnnInitOptions, Domain, Handle, WriterSession};
use uuid::Uuid;

const DIMS: usize = 4;

fn open_env(path: &Path) -> Env {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let opts = EnvOptions {
        external_locking: true,
        ..EnvOptions::default()
    };
    Env::open(path, opts).unwrap()
}

fn init_domain(env: &Env, name: &str) -> Domain {
    let domain = Domain::open(env, name).unwrap();
    let txn = env.write_txn().unwrap();
    domain
        .store_init_options(&txn, &AnnInitOptions::new(DIMS))
        .unwrap();
    txn.commit().unwrap();
    domain
}

fn publish_one(env: &Env, domain: &Domain, handle: &Handle, key: u64, vector: [f32; DIMS]) {
    let session = WriterSession::acquire(env.path()).unwrap();
    let mut ctx = domain.txn_ctx(&session, handle);
    let txn = env.write_txn().unwrap();
    ctx.stage_add(&txn, key, &vector).unwrap();
    ctx.apply_pending(&txn).unwrap();
    txn.commit().unwrap();
    domain.publish_log(ctx, true).unwrap();
}

fn segment_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn writer_killed_after_commit_before_publish() {
    let dir = tempfile::tempdir().unwrap();
    let pending = dir.path().join("pending").join("crashy");
    {
        let env = open_env(dir.path());
        let domain = init_domain(&env, "crashy");
        let handle = domain.activate().unwrap();
        let session = WriterSession::acquire(env.path()).unwrap();
        let mut ctx = domain.txn_ctx(&session, &handle);
        let txn = env.write_txn().unwrap();
        ctx.stage_add(&txn, 11, &[0.9, 0.8, 0.7, 0.6]).unwrap();
        ctx.apply_pending(&txn).unwrap();
        txn.commit().unwrap();
        // Crash: publish never runs, the drop cleanup never runs.
        std::mem::forget(ctx);
    }
    // The committed transaction's segment survived as an open file.
    let names = segment_files(&pending);
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with(".ulog"), "left: {names:?}");

    let env = open_env(dir.path());
    let domain = init_domain(&env, "crashy");
    // Recovery consumed the segment; the update is visible from durable
    // state.
    assert_eq!(segment_files(&pending).len(), 0);
    let handle = domain.activate().unwrap();
    assert!(handle.contains(11));
}

#[test]
fn writer_killed_before_commit_loses_the_update() {
    let dir = tempfile::tempdir().unwrap();
    let pending = dir.path().join("pending").join("lossy");
    {
        let env = open_env(dir.path());
        let domain = init_domain(&env, "lossy");
        let handle = domain.activate().unwrap();
        let session = WriterSession::acquire(env.path()).unwrap();
        let mut ctx = domain.txn_ctx(&session, &handle);
        let txn = env.write_txn().unwrap();
        ctx.stage_add(&txn, 12, &[0.1, 0.1, 0.1, 0.1]).unwrap();
        // Crash before apply/commit: the base transaction evaporates.
        txn.abort();
        std::mem::forget(ctx);
    }
    assert_eq!(segment_files(&pending).len(), 1);

    let env = open_env(dir.path());
    let domain = init_domain(&env, "lossy");
    // The stray OPEN segment is discarded, not replayed.
    assert_eq!(segment_files(&pending).len(), 0);
    assert!(!domain.activate().unwrap().contains(12));
}

#[test]
fn checkpoint_orphans_are_cleaned_without_touching_good_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(dir.path());
    let domain = init_domain(&env, "cp");
    let handle = domain.activate().unwrap();
    let session = WriterSession::acquire(env.path()).unwrap();

    let mut ctx = domain.txn_ctx(&session, &handle);
    let txn = env.write_txn().unwrap();
    ctx.stage_add(&txn, 1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
    ctx.apply_pending(&txn).unwrap();
    txn.commit().unwrap();
    domain.publish_log(ctx, true).unwrap();
    let good = domain.checkpoint_write_snapshot(&session, &handle).unwrap();

    // A writer died mid-write (tmp orphan) and another snapshot rotted.
    let cp_dir = dir.path().join("checkpoints").join("cp");
    fs::create_dir_all(cp_dir.join("9.tmp")).unwrap();
    fs::write(cp_dir.join("9.tmp").join("chunk-000000"), b"half").unwrap();
    fs::create_dir_all(cp_dir.join("8")).unwrap();
    fs::write(cp_dir.join("8").join("manifest"), b"not a manifest").unwrap();

    domain.checkpoint_recover().unwrap();
    assert!(!cp_dir.join("9.tmp").exists());
    assert!(!cp_dir.join("8").exists());
    assert!(cp_dir.join(good.seq.to_string()).exists());

    // The surviving snapshot still activates.
    let fresh = domain.activate().unwrap();
    assert!(fresh.contains(1));
}

#[test]
fn pending_marker_blocks_checkpoints_until_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(dir.path());
    let domain = init_domain(&env, "busy");
    let handle = domain.activate().unwrap();
    let session = WriterSession::acquire(env.path()).unwrap();

    let mut ctx = domain.txn_ctx(&session, &handle);
    let txn = env.write_txn().unwrap();
    ctx.stage_add(&txn, 2, &[0.0, 1.0, 0.0, 0.0]).unwrap();
    ctx.apply_pending(&txn).unwrap();
    txn.commit().unwrap();
    domain.publish_log(ctx, true).unwrap();

    // Forge the durable marker a crashed writer would leave in the
    // Writing stage: stage byte, target seq, writer uuid.
    let meta_db = env
        .open_database("busy/usearch-meta", DatabaseFlags::default())
        .unwrap();
    let mut record = Vec::with_capacity(25);
    record.push(1u8);
    record.extend_from_slice(&u64_be(1));
    record.extend_from_slice(Uuid::new_v4().as_bytes());
    let txn = env.write_txn().unwrap();
    txn.put(&meta_db, b"checkpoint_pending", &record).unwrap();
    txn.commit().unwrap();

    assert!(matches!(
        domain.checkpoint_write_snapshot(&session, &handle),
        Err(Error::Busy(_))
    ));

    domain.checkpoint_recover().unwrap();
    let info = domain.checkpoint_write_snapshot(&session, &handle).unwrap();
    assert_eq!(info.seq, 1);
}

#[test]
fn interrupted_finalize_is_resumed_on_recover() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(dir.path());
    let domain = init_domain(&env, "fin");
    let handle = domain.activate().unwrap();
    let session = WriterSession::acquire(env.path()).unwrap();

    let mut ctx = domain.txn_ctx(&session, &handle);
    let txn = env.write_txn().unwrap();
    ctx.stage_add(&txn, 3, &[0.0, 0.0, 1.0, 0.0]).unwrap();
    ctx.apply_pending(&txn).unwrap();
    txn.commit().unwrap();
    domain.publish_log(ctx, true).unwrap();
    let info = domain.checkpoint_write_snapshot(&session, &handle).unwrap();

    // Re-arm the marker in the Finalizing stage, as if the crash hit
    // after the rename but before the bookkeeping commit.
    let meta_db = env
        .open_database("fin/usearch-meta", DatabaseFlags::default())
        .unwrap();
    let mut record = Vec::with_capacity(25);
    record.push(2u8);
    record.extend_from_slice(&u64_be(info.seq));
    record.extend_from_slice(Uuid::new_v4().as_bytes());
    let txn = env.write_txn().unwrap();
    txn.put(&meta_db, b"checkpoint_pending", &record).unwrap();
    txn.commit().unwrap();

    domain.checkpoint_recover().unwrap();
    // The marker is gone and checkpointing works again.
    assert!(matches!(
        domain.checkpoint_write_snapshot(&session, &handle),
        Ok(_)
    ));
    let fresh = domain.activate().unwrap();
    assert!(fresh.contains(3));
}

#[test]
fn older_snapshot_remains_a_usable_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(dir.path());
    let domain = init_domain(&env, "fall");
    let handle = domain.activate().unwrap();

    publish_one(&env, &domain, &handle, 1, [1.0, 0.0, 0.0, 0.0]);
    let session = WriterSession::acquire(env.path()).unwrap();
    domain.checkpoint_write_snapshot(&session, &handle).unwrap();
    drop(session);
    publish_one(&env, &domain, &handle, 2, [0.0, 1.0, 0.0, 0.0]);
    let session = WriterSession::acquire(env.path()).unwrap();
    let second = domain.checkpoint_write_snapshot(&session, &handle).unwrap();
    drop(session);

    // The newest snapshot rots on disk; the previous one must still cover
    // everything the pruned catalog no longer holds.
    let cp = dir
        .path()
        .join("checkpoints")
        .join("fall")
        .join(second.seq.to_string());
    fs::write(cp.join("chunk-000000"), b"rotten").unwrap();

    let fresh = domain.activate().unwrap();
    assert_eq!(fresh.applied_seq(), 2);
    assert!(fresh.contains(1), "older snapshot lost vector 1");
    assert!(fresh.contains(2), "catalog replay lost vector 2");
    assert_eq!(fresh.len(), 2);
}

#[test]
fn missing_snapshots_below_the_tail_surface_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(dir.path());
    let domain = init_domain(&env, "gone");
    let handle = domain.activate().unwrap();

    publish_one(&env, &domain, &handle, 1, [1.0, 0.0, 0.0, 0.0]);
    let session = WriterSession::acquire(env.path()).unwrap();
    domain.checkpoint_write_snapshot(&session, &handle).unwrap();
    drop(session);

    // Every snapshot vanishes wholesale, say through a botched restore.
    // The catalog below the tail is gone with them, so activation must
    // refuse rather than serve an index that silently lost updates.
    fs::remove_dir_all(dir.path().join("checkpoints").join("gone")).unwrap();
    assert!(matches!(domain.activate(), Err(Error::Corruption(_))));
}

#[test]
fn base_store_reopen_preserves_vector_catalog() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = open_env(dir.path());
        let domain = init_domain(&env, "durable");
        let handle = domain.activate().unwrap();
        let session = WriterSession::acquire(env.path()).unwrap();
        let mut ctx = domain.txn_ctx(&session, &handle);
        let txn = env.write_txn().unwrap();
        ctx.stage_add(&txn, 21, &[0.2, 0.4, 0.6, 0.8]).unwrap();
        ctx.apply_pending(&txn).unwrap();
        txn.commit().unwrap();
        domain.publish_log(ctx, true).unwrap();
    }
    let env = open_env(dir.path());
    let domain = init_domain(&env, "durable");
    let handle = domain.activate().unwrap();
    assert!(handle.contains(21));
    assert_eq!(handle.dimensions(), DIMS);
}
