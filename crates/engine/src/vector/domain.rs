//! Domains: named vector collections with a staged-update protocol.
//!
//! A domain binds three durable artifacts inside one environment:
//!
//! - the meta sub-database `"<name>/usearch-meta"` (sequence watermarks,
//!   stored init options, recovery records);
//! - the delta catalog `"<name>/usearch-delta"`, every staged update keyed
//!   by its log sequence, durable through the base store's own commit;
//! - the pending directory `<env>/pending/<name>` of per-transaction WAL
//!   segments, plus `<env>/checkpoints/<name>` of full snapshots.
//!
//! A write flows stage → apply → base commit → publish. Staging journals
//! the update into the catalog and the transaction's segment; apply gives
//! the writer's own handle read-your-writes and records the sealed-segment
//! marker in the same transaction; commit makes all of that durable at
//! once; publish seals the segment file, propagates the delta to every
//! other live handle in the process and acknowledges the tail. Other
//! processes catch up through `refresh`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use cairn_core::bytes::{read_u64_be, u64_be};
use cairn_core::{DatabaseFlags, Error, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{Database, Env, ReadView, RoTxn, RwTxn};

use super::ann::{AnnFactory, AnnInitOptions, BruteForceFactory};
use super::checkpoint::{self, DEFAULT_CHUNK_SIZE, DEFAULT_RETENTION};
use super::delta::{DeltaOp, PendingUpdate};
use super::handle::{Handle, HandleShared, HandleState};
use super::lock::WriterSession;
use super::meta::{CheckpointPending, MetaDb, PendingStage, SCHEMA_VERSION};
use super::pins::{self, PinDb, PinRecord};
use super::wal::{self, SegmentWriter};

const PENDING_DIR: &str = "pending";
const CHECKPOINTS_DIR: &str = "checkpoints";

/// Result of a completed checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointInfo {
    pub seq: u64,
    pub chunk_count: u32,
}

/// Stored configuration and schema version, for tooling.
#[derive(Debug, Clone)]
pub struct DomainInfo {
    pub schema_version: u64,
    pub options: Option<AnnInitOptions>,
}

/// A named vector collection bound to one environment.
pub struct Domain {
    env: Env,
    name: String,
    meta: MetaDb,
    delta_db: Database,
    pins: PinDb,
    pending_dir: PathBuf,
    checkpoints_dir: PathBuf,
    handles: Mutex<Vec<Weak<HandleShared>>>,
    factory: Arc<dyn AnnFactory>,
    chunk_size: AtomicUsize,
}

impl Domain {
    /// Open or resume a domain with the built-in exact index, keeping its
    /// filesystem artifacts inside the environment directory.
    pub fn open(env: &Env, name: &str) -> Result<Domain> {
        Domain::open_with_factory(env, name, None, Arc::new(BruteForceFactory))
    }

    /// Like [`Domain::open`], but with the pending and checkpoint
    /// directories rooted at `ann_root` instead of the environment path.
    pub fn open_at(env: &Env, name: &str, ann_root: &Path) -> Result<Domain> {
        Domain::open_with_factory(env, name, Some(ann_root), Arc::new(BruteForceFactory))
    }

    /// Open or resume a domain, running segment and checkpoint recovery.
    pub fn open_with_factory(
        env: &Env,
        name: &str,
        ann_root: Option<&Path>,
        factory: Arc<dyn AnnFactory>,
    ) -> Result<Domain> {
        let meta_db = env.open_database(&format!("{name}/usearch-meta"), DatabaseFlags::CREATE)?;
        let delta_db = env.open_database(
            &format!("{name}/usearch-delta"),
            DatabaseFlags::CREATE.with_counted(),
        )?;
        let pins_db = env.open_database(&format!("{name}/usearch-pins"), DatabaseFlags::CREATE)?;
        let root = ann_root.unwrap_or_else(|| env.path());
        let pending_dir = root.join(PENDING_DIR).join(name);
        let checkpoints_dir = root.join(CHECKPOINTS_DIR).join(name);
        fs::create_dir_all(&pending_dir)?;
        fs::create_dir_all(&checkpoints_dir)?;

        let meta = MetaDb::new(meta_db);
        {
            let txn = env.write_txn()?;
            match meta.schema_version(&txn)? {
                None => {
                    meta.set_schema_version(&txn)?;
                    txn.commit()?;
                }
                Some(SCHEMA_VERSION) => txn.abort(),
                Some(other) => {
                    return Err(Error::config(format!(
                        "domain '{name}' has schema version {other}, expected {SCHEMA_VERSION}"
                    )))
                }
            }
        }

        let domain = Domain {
            env: env.clone(),
            name: name.to_string(),
            meta,
            delta_db,
            pins: PinDb::new(pins_db),
            pending_dir,
            checkpoints_dir,
            handles: Mutex::new(Vec::new()),
            factory,
            chunk_size: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
        };
        domain.recover_segments()?;
        domain.checkpoint_recover()?;
        Ok(domain)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persist the domain's ANN configuration. The first stored value wins;
    /// re-storing a different one is a configuration error.
    pub fn store_init_options(&self, txn: &RwTxn<'_>, options: &AnnInitOptions) -> Result<()> {
        match self.meta.init_options(txn)? {
            None => self.meta.set_init_options(txn, options),
            Some(existing) if existing == *options => Ok(()),
            Some(_) => Err(Error::config(format!(
                "domain '{}' is already initialized with different options",
                self.name
            ))),
        }
    }

    pub fn load_init_options(&self, view: &impl ReadView) -> Result<Option<AnnInitOptions>> {
        self.meta.init_options(view)
    }

    /// Schema version and stored options, for inspection tooling.
    pub fn format_info(&self, view: &impl ReadView) -> Result<DomainInfo> {
        Ok(DomainInfo {
            schema_version: self.meta.schema_version(view)?.unwrap_or(SCHEMA_VERSION),
            options: self.meta.init_options(view)?,
        })
    }

    // ========================================================================
    // Activation and refresh
    // ========================================================================

    /// Instantiate an index equal to durable state: latest checkpoint plus
    /// the delta catalog after it.
    pub fn activate(&self) -> Result<Handle> {
        let ro = self.env.read_txn();
        let options = self.meta.init_options(&ro)?.ok_or_else(|| {
            Error::not_found(format!("domain '{}' has no stored init options", self.name))
        })?;
        let mut index = self.factory.create(&options)?;
        let mut applied = 0u64;
        if let Some((seq, buffer)) = checkpoint::load_latest(&self.checkpoints_dir)? {
            index.load_buffer(&buffer)?;
            applied = seq;
        }
        let tail = self.meta.log_tail_seq(&ro)?;
        if applied < tail {
            // The catalog below the tail is gone and no intact snapshot
            // covers it; replaying from here would silently drop updates.
            return Err(Error::corruption(format!(
                "domain '{}': no loadable checkpoint at or above the pruned tail {tail}",
                self.name
            )));
        }
        let log_seq = self.meta.log_seq(&ro)?;
        let mut state = HandleState {
            index,
            applied_seq: applied,
        };
        self.replay_catalog(&ro, applied, log_seq, |seq, update| {
            state.apply(&update)?;
            state.applied_seq = seq;
            Ok(())
        })?;
        state.applied_seq = state.applied_seq.max(log_seq);
        debug!(
            domain = %self.name,
            applied_seq = state.applied_seq,
            vectors = state.index.len(),
            "activated handle"
        );
        let shared = Arc::new(HandleShared {
            state: Mutex::new(state),
        });
        self.handles.lock().push(Arc::downgrade(&shared));
        Ok(Handle { shared })
    }

    /// Bring a handle up to durable state under a read-only transaction.
    /// Idempotent; needed after another process published, or a restart.
    pub fn refresh(&self, handle: &Handle, txn: &RoTxn) -> Result<()> {
        let log_seq = self.meta.log_seq(txn)?;
        let tail = self.meta.log_tail_seq(txn)?;
        let mut st = handle.shared.state.lock();
        if st.applied_seq >= log_seq {
            return Ok(());
        }
        if st.applied_seq < tail {
            // The catalog no longer reaches back this far; rebuild from the
            // newest checkpoint.
            let options = self.meta.init_options(txn)?.ok_or_else(|| {
                Error::not_found(format!("domain '{}' has no stored init options", self.name))
            })?;
            let mut index = self.factory.create(&options)?;
            let mut applied = 0u64;
            if let Some((seq, buffer)) = checkpoint::load_latest(&self.checkpoints_dir)? {
                index.load_buffer(&buffer)?;
                applied = seq;
            }
            if applied < tail {
                return Err(Error::corruption(format!(
                    "domain '{}': no loadable checkpoint at or above the pruned tail {tail}",
                    self.name
                )));
            }
            st.index = index;
            st.applied_seq = applied;
        }
        let from = st.applied_seq;
        self.replay_catalog(txn, from, log_seq, |seq, update| {
            st.apply(&update)?;
            st.applied_seq = seq;
            Ok(())
        })?;
        st.applied_seq = st.applied_seq.max(log_seq);
        Ok(())
    }

    /// Drop a handle and forget its back-reference. Durable artifacts are
    /// untouched.
    pub fn deactivate(&self, handle: Handle) {
        let mut handles = self.handles.lock();
        handles.retain(|weak| {
            weak.upgrade()
                .map_or(false, |shared| !Arc::ptr_eq(&shared, &handle.shared))
        });
    }

    /// Release process-local resources. Never deletes durable artifacts.
    pub fn close(self) {}

    // ========================================================================
    // Reader pins
    // ========================================================================

    /// Register `reader` as needing the catalog from the handle's applied
    /// position onward. `compact` and checkpoint finalize will not prune
    /// past it until it is released or its lease expires.
    pub fn pin_reader(&self, reader: Uuid, handle: &Handle, lease: Duration) -> Result<()> {
        let txn = self.env.write_txn()?;
        let record = PinRecord {
            snapshot_seq: self.meta.snapshot_seq(&txn)?.unwrap_or(0),
            log_seq: handle.applied_seq(),
            expires_at_ms: pins::now_ms().saturating_add(lease.as_millis() as u64),
        };
        self.pins.set(&txn, reader, record)?;
        txn.commit()?;
        debug!(domain = %self.name, %reader, log_seq = record.log_seq, "pinned reader");
        Ok(())
    }

    /// Extend an existing pin's lease without moving its positions.
    pub fn touch_pin(&self, reader: Uuid, lease: Duration) -> Result<()> {
        let txn = self.env.write_txn()?;
        let Some(mut record) = self.pins.get(&txn, reader)? else {
            txn.abort();
            return Err(Error::not_found(format!(
                "reader {reader} holds no pin in domain '{}'",
                self.name
            )));
        };
        record.expires_at_ms = pins::now_ms().saturating_add(lease.as_millis() as u64);
        self.pins.set(&txn, reader, record)?;
        txn.commit()
    }

    /// Drop a reader's pin. A missing pin is not an error.
    pub fn release_pin(&self, reader: Uuid) -> Result<()> {
        let txn = self.env.write_txn()?;
        self.pins.remove(&txn, reader)?;
        txn.commit()
    }

    // ========================================================================
    // Staging and publishing
    // ========================================================================

    /// Begin a staging context for one base write transaction. The writer
    /// session proves cross-process exclusivity; the handle receives
    /// read-your-writes on `apply_pending`.
    pub fn txn_ctx<'a>(&'a self, session: &'a WriterSession, handle: &Handle) -> TxnCtx<'a> {
        TxnCtx {
            domain: self,
            _session: session,
            handle: handle.shared.clone(),
            token: Uuid::new_v4(),
            segment: None,
            staged: Vec::new(),
            applied: false,
            published: false,
        }
    }

    /// Seal the context's segment, propagate its delta to every other live
    /// handle in this process, and acknowledge the published tail.
    ///
    /// Call after the base transaction committed. `fsync` forces segment
    /// durability before returning.
    pub fn publish_log(&self, mut ctx: TxnCtx<'_>, fsync: bool) -> Result<()> {
        if ctx.staged.is_empty() {
            ctx.published = true;
            return Ok(());
        }
        if !ctx.applied {
            return Err(Error::invalid(
                "apply_pending must run before publish_log",
            ));
        }
        let segment = ctx
            .segment
            .take()
            .ok_or_else(|| Error::invalid("transaction context has no open segment"))?;
        let sealed = segment.seal(fsync)?;
        let last_ordinal = ctx.staged.len() as u32 - 1;

        let mut handles = self.handles.lock();
        handles.retain(|weak| weak.strong_count() > 0);
        for weak in handles.iter() {
            let Some(shared) = weak.upgrade() else { continue };
            if Arc::ptr_eq(&shared, &ctx.handle) {
                continue;
            }
            let mut st = shared.state.lock();
            for (seq, update) in &ctx.staged {
                if *seq > st.applied_seq {
                    st.apply(update)?;
                    st.applied_seq = *seq;
                }
            }
        }
        drop(handles);

        // The catalog already holds every update durably; once the tail is
        // acknowledged the segment file is redundant.
        let txn = self.env.write_txn()?;
        self.meta.set_published_tail(&txn, ctx.token, last_ordinal)?;
        txn.commit()?;
        fs::remove_file(&sealed)?;
        ctx.published = true;
        info!(
            domain = %self.name,
            token = %ctx.token,
            updates = ctx.staged.len(),
            "published staged updates"
        );
        Ok(())
    }

    /// Prune the delta catalog up to the oldest position any retained
    /// snapshot or live reader pin still needs, bounding its growth without
    /// changing logical content.
    pub fn compact(&self, fsync: bool) -> Result<()> {
        let txn = self.env.write_txn()?;
        let Some(snapshot) = self.meta.snapshot_seq(&txn)? else {
            txn.abort();
            return Ok(());
        };
        let floor = self.prune_floor(&txn, snapshot)?;
        let tail = self.meta.log_tail_seq(&txn)?;
        if floor <= tail {
            txn.abort();
            return Ok(());
        }
        self.prune_catalog(&txn, tail, floor)?;
        self.meta.set_log_tail_seq(&txn, floor)?;
        txn.commit()?;
        if fsync {
            self.env.sync()?;
        }
        debug!(domain = %self.name, upto = floor, "compacted delta catalog");
        Ok(())
    }

    /// Highest catalog position that is safe to prune: held down by the
    /// oldest retained snapshot (older snapshots must stay replayable as
    /// fallbacks) and by the lowest unexpired reader pin.
    fn prune_floor(&self, view: &impl ReadView, newest_snapshot: u64) -> Result<u64> {
        let mut floor = checkpoint::list_seqs(&self.checkpoints_dir)?
            .first()
            .copied()
            .unwrap_or(newest_snapshot);
        if let Some(pinned) = self.pins.floor(view, pins::now_ms())? {
            floor = floor.min(pinned);
        }
        Ok(floor)
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    /// Persist a full snapshot of the handle's index at its applied
    /// position, atomically, then prune the catalog it covers.
    pub fn checkpoint_write_snapshot(
        &self,
        session: &WriterSession,
        handle: &Handle,
    ) -> Result<CheckpointInfo> {
        {
            let ro = self.env.read_txn();
            if self.meta.checkpoint_pending(&ro)?.is_some() {
                return Err(Error::busy(format!(
                    "a checkpoint is already pending for domain '{}'",
                    self.name
                )));
            }
            let snapshot = self.meta.snapshot_seq(&ro)?;
            let log_seq = self.meta.log_seq(&ro)?;
            let applied = handle.applied_seq();
            if applied > log_seq {
                return Err(Error::invalid(
                    "handle is ahead of the durable log; commit before checkpointing",
                ));
            }
            // Nothing new since the last snapshot, or nothing at all yet.
            match snapshot {
                Some(snap) if applied <= snap => {
                    return Ok(CheckpointInfo {
                        seq: snap,
                        chunk_count: 0,
                    });
                }
                None if applied == 0 => {
                    return Ok(CheckpointInfo {
                        seq: 0,
                        chunk_count: 0,
                    });
                }
                _ => {}
            }
        }
        let (seq, buffer) = {
            let st = handle.shared.state.lock();
            (st.applied_seq, st.index.save_buffer()?)
        };
        let writer = session.uuid();

        let txn = self.env.write_txn()?;
        self.meta.set_checkpoint_pending(
            &txn,
            CheckpointPending {
                stage: PendingStage::Writing,
                seq,
                writer,
            },
        )?;
        txn.commit()?;

        let chunk_count = checkpoint::write_tmp(
            &self.checkpoints_dir,
            seq,
            writer,
            &buffer,
            self.checkpoint_chunk_size(),
        )?;

        let txn = self.env.write_txn()?;
        self.meta.set_checkpoint_pending(
            &txn,
            CheckpointPending {
                stage: PendingStage::Finalizing,
                seq,
                writer,
            },
        )?;
        txn.commit()?;

        checkpoint::publish(&self.checkpoints_dir, seq)?;
        self.finalize_checkpoint(seq)?;
        info!(domain = %self.name, seq, chunk_count, "wrote checkpoint");
        Ok(CheckpointInfo { seq, chunk_count })
    }

    /// Checkpoint chunk file size in bytes. Defaults to 1 MiB.
    pub fn checkpoint_chunk_size(&self) -> usize {
        self.chunk_size.load(Ordering::Relaxed)
    }

    /// Change the chunk size used by future checkpoints. Values below one
    /// byte are clamped.
    pub fn set_checkpoint_chunk_size(&self, bytes: usize) {
        self.chunk_size.store(bytes.max(1), Ordering::Relaxed);
    }

    /// Discard incomplete snapshot artifacts and finish an interrupted
    /// finalize. Safe on a clean domain.
    pub fn checkpoint_recover(&self) -> Result<()> {
        let pending = {
            let ro = self.env.read_txn();
            self.meta.checkpoint_pending(&ro)?
        };
        checkpoint::recover(&self.checkpoints_dir)?;
        if let Some(p) = pending {
            let published = self.checkpoints_dir.join(p.seq.to_string());
            if p.stage == PendingStage::Finalizing && published.exists() {
                // The rename landed before the crash; finish bookkeeping.
                info!(domain = %self.name, seq = p.seq, "resuming interrupted checkpoint finalize");
                self.finalize_checkpoint(p.seq)?;
            } else {
                warn!(domain = %self.name, seq = p.seq, "discarding interrupted checkpoint");
                let txn = self.env.write_txn()?;
                self.meta.clear_checkpoint_pending(&txn)?;
                txn.commit()?;
            }
        }
        Ok(())
    }

    fn finalize_checkpoint(&self, seq: u64) -> Result<()> {
        checkpoint::prune(&self.checkpoints_dir, DEFAULT_RETENTION)?;
        let txn = self.env.write_txn()?;
        let floor = self.prune_floor(&txn, seq)?;
        let tail = self.meta.log_tail_seq(&txn)?;
        if floor > tail {
            self.prune_catalog(&txn, tail, floor)?;
            self.meta.set_log_tail_seq(&txn, floor)?;
        }
        self.meta.set_snapshot_seq(&txn, seq)?;
        self.meta.clear_checkpoint_pending(&txn)?;
        txn.commit()
    }

    // ========================================================================
    // Recovery and catalog plumbing
    // ========================================================================

    /// Clean the pending directory after a crash: discard OPEN strays,
    /// promote the committed-but-unpublished segment, acknowledge it from
    /// the durable catalog, and delete what is fully covered.
    fn recover_segments(&self) -> Result<()> {
        let (sealed_meta, published) = {
            let ro = self.env.read_txn();
            (
                self.meta.sealed_segment(&ro)?,
                self.meta.published_tail(&ro)?,
            )
        };
        let committed_token = sealed_meta.map(|(token, _)| token);
        let published_token = published.map(|(token, _)| token);
        let needs_ack = committed_token.is_some() && committed_token != published_token;

        let mut ack_ordinal = 0u32;
        for entry in fs::read_dir(&self.pending_dir)? {
            let path = entry?.path();
            let Some(token) = wal::token_from_path(&path) else {
                continue;
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let committed = Some(token) == committed_token;
            if name.ends_with(wal::SEALED_EXT) {
                if committed && needs_ack {
                    let (header, _) = wal::read_segment(&path)?;
                    ack_ordinal = header.frame_count.saturating_sub(1);
                    // Deleted below, after the tail is acknowledged.
                } else {
                    warn!(path = %path.display(), "removing superseded sealed segment");
                    fs::remove_file(&path)?;
                }
            } else if name.ends_with(wal::OPEN_EXT) {
                if committed && needs_ack {
                    info!(path = %path.display(), "promoting committed segment left open by a crash");
                    let sealed = wal::seal_in_place(&path)?;
                    let (header, _) = wal::read_segment(&sealed)?;
                    ack_ordinal = header.frame_count.saturating_sub(1);
                } else {
                    warn!(path = %path.display(), "removing stray open segment");
                    fs::remove_file(&path)?;
                }
            }
        }

        if needs_ack {
            // Safe to acknowledge unconditionally: the catalog was made
            // durable by the same commit that wrote the sealed-segment
            // record.
            let token = committed_token.unwrap_or_default();
            let txn = self.env.write_txn()?;
            self.meta.set_published_tail(&txn, token, ack_ordinal)?;
            txn.commit()?;
            let sealed_file = wal::sealed_path(&self.pending_dir, token);
            if sealed_file.exists() {
                fs::remove_file(&sealed_file)?;
            }
            info!(domain = %self.name, token = %token, "recovered committed segment into the published tail");
        }
        Ok(())
    }

    /// Apply every catalog record with sequence in `(from_excl, to_incl]`.
    fn replay_catalog<V: ReadView>(
        &self,
        view: &V,
        from_excl: u64,
        to_incl: u64,
        mut apply: impl FnMut(u64, PendingUpdate) -> Result<()>,
    ) -> Result<()> {
        if to_incl <= from_excl {
            return Ok(());
        }
        let tree = view.tree(&self.delta_db)?;
        let start = u64_be(from_excl + 1);
        let loc = tree.locate_key(&start);
        let mut walker = tree.walk_entries_from(loc.entries_before);
        while let Some((key, value)) = walker.next() {
            let seq = read_u64_be(&key)?;
            if seq > to_incl {
                break;
            }
            let update = PendingUpdate::decode(&value)?;
            apply(seq, update)?;
        }
        Ok(())
    }

    /// Delete catalog records with sequence in `(from_excl, to_incl]`.
    fn prune_catalog(&self, txn: &RwTxn<'_>, from_excl: u64, to_incl: u64) -> Result<()> {
        let tree = txn.tree(&self.delta_db)?;
        let start = u64_be(from_excl + 1);
        let loc = tree.locate_key(&start);
        let mut walker = tree.walk_keys_from(loc.keys_before);
        let mut doomed = Vec::new();
        while let Some(key) = walker.next() {
            if read_u64_be(&key)? > to_incl {
                break;
            }
            doomed.push(key);
        }
        for key in doomed {
            txn.del(&self.delta_db, &key, None)?;
        }
        Ok(())
    }
}

/// Staging context for one base write transaction.
///
/// Dropping an unpublished context removes its segment file, which models
/// transaction abort; a real crash skips the cleanup and leaves the file
/// for recovery to judge.
pub struct TxnCtx<'a> {
    domain: &'a Domain,
    _session: &'a WriterSession,
    handle: Arc<HandleShared>,
    token: Uuid,
    segment: Option<SegmentWriter>,
    staged: Vec<(u64, PendingUpdate)>,
    applied: bool,
    published: bool,
}

impl TxnCtx<'_> {
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Record one pending mutation: into the delta catalog under the
    /// caller's transaction, and into this context's WAL segment.
    pub fn stage_update(&mut self, txn: &RwTxn<'_>, key: u64, op: DeltaOp) -> Result<()> {
        let options = self.domain.meta.init_options(txn)?.ok_or_else(|| {
            Error::not_found(format!(
                "domain '{}' has no stored init options",
                self.domain.name
            ))
        })?;
        if let DeltaOp::Add(vector) | DeltaOp::Replace(vector) = &op {
            if vector.len() != options.dimensions {
                return Err(Error::config(format!(
                    "vector has {} dimensions, domain '{}' expects {}",
                    vector.len(),
                    self.domain.name,
                    options.dimensions
                )));
            }
        }
        let seq = self.domain.meta.log_seq(txn)? + 1;
        if self.segment.is_none() {
            let snapshot = self.domain.meta.snapshot_seq(txn)?.unwrap_or(0);
            self.segment = Some(SegmentWriter::create(
                &self.domain.pending_dir,
                self.token,
                snapshot,
                seq,
            )?);
        }
        let ordinal = self.staged.len() as u32;
        let update = PendingUpdate {
            key,
            op,
            scalar: options.quantization,
            dimensions: options.dimensions as u32,
            ordinal,
            token: self.token,
        };
        let record = update.encode();
        txn.put(&self.domain.delta_db, &u64_be(seq), &record)?;
        self.domain.meta.set_log_seq(txn, seq)?;
        if let Some(segment) = &mut self.segment {
            segment.append_frame(ordinal, &record)?;
        }
        self.staged.push((seq, update));
        Ok(())
    }

    pub fn stage_add(&mut self, txn: &RwTxn<'_>, key: u64, vector: &[f32]) -> Result<()> {
        self.stage_update(txn, key, DeltaOp::Add(vector.to_vec()))
    }

    /// Insert-or-overwrite, where a plain add of a present key errors.
    pub fn stage_replace(&mut self, txn: &RwTxn<'_>, key: u64, vector: &[f32]) -> Result<()> {
        self.stage_update(txn, key, DeltaOp::Replace(vector.to_vec()))
    }

    pub fn stage_delete(&mut self, txn: &RwTxn<'_>, key: u64) -> Result<()> {
        self.stage_update(txn, key, DeltaOp::Remove)
    }

    /// Apply everything staged in this context to the writer's own handle
    /// (read-your-writes before commit) and record the sealed-segment
    /// marker so the commit vouches for the segment.
    pub fn apply_pending(&mut self, txn: &RwTxn<'_>) -> Result<()> {
        if self.staged.is_empty() {
            self.applied = true;
            return Ok(());
        }
        {
            let mut st = self.handle.state.lock();
            for (seq, update) in &self.staged {
                st.apply(update)?;
                st.applied_seq = *seq;
            }
        }
        let last_seq = self.staged.last().map(|(seq, _)| *seq).unwrap_or(0);
        self.domain.meta.set_sealed_segment(txn, self.token, last_seq)?;
        if let Some(segment) = &mut self.segment {
            segment.sync()?;
        }
        self.applied = true;
        Ok(())
    }

    /// Discard the context and its segment file.
    pub fn abort(self) {}
}

impl Drop for TxnCtx<'_> {
    fn drop(&mut self) {
        if !self.published {
            if let Some(segment) = self.segment.take() {
                let path = segment.path().to_path_buf();
                if let Err(e) = segment.abort() {
                    warn!(path = %path.display(), error = %e, "failed to remove aborted segment");
                }
            }
        }
    }
}
