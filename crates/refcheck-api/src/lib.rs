use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use refcheck_core::{
    check, CheckOutcome, DocumentStore, OrphanGroup, ReconcileError, Schema, UnresolvedReference,
};
use refcheck_store_xml::XmlDocumentStore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    Unloaded,
    Ready,
    LoadFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckReport {
    pub document: PathBuf,
    pub document_sha256: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub entity_count: usize,
    pub link_count: usize,
    pub distinct_link_owner_count: usize,
    pub orphan_link_count: usize,
    pub orphan_groups: Vec<OrphanGroup>,
    pub unresolved: Vec<UnresolvedReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub removed_links: usize,
    pub removed_owner_keys: Vec<String>,
    pub dropped_groups: Vec<String>,
    pub persisted: bool,
}

/// Opens a document in whatever viewer the host environment provides.
pub trait Launcher {
    /// # Errors
    /// Returns the launcher's I/O error when the viewer cannot be started.
    fn launch(&self, path: &Path) -> std::io::Result<()>;
}

#[derive(Debug)]
struct Session<S> {
    store: S,
    outcome: CheckOutcome,
    checked_at: OffsetDateTime,
}

impl<S: DocumentStore> Session<S> {
    fn report(&self) -> CheckReport {
        CheckReport {
            document: self.store.location().to_path_buf(),
            document_sha256: self.store.content_digest().map(ToString::to_string),
            checked_at: self.checked_at,
            entity_count: self.outcome.entity_count,
            link_count: self.outcome.link_count,
            distinct_link_owner_count: self.outcome.distinct_link_owner_count,
            orphan_link_count: self.outcome.orphan_link_count,
            orphan_groups: self.outcome.groups.as_slice().to_vec(),
            unresolved: self.outcome.unresolved.clone(),
        }
    }
}

#[derive(Debug)]
enum State<S> {
    Unloaded,
    Ready(Session<S>),
    LoadFailed { path: PathBuf, reason: String },
}

/// Reconciliation controller over a single loaded document.
///
/// Every operation holds one lock for its whole duration, so the group
/// sequence observed through [`Reconciler::groups`] always matches the last
/// successfully persisted document.
#[derive(Debug)]
pub struct Reconciler<S: DocumentStore = XmlDocumentStore> {
    schema: Schema,
    state: Mutex<State<S>>,
}

/// Extension match ignores ASCII case, so `.XML` exports load like `.xml`.
fn has_xml_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("xml"))
}

impl<S: DocumentStore> Reconciler<S> {
    /// # Errors
    /// Returns [`ReconcileError::InvalidSchema`] when the schema fails validation.
    pub fn new(schema: Schema) -> Result<Self, ReconcileError> {
        schema.validate()?;
        Ok(Self { schema, state: Mutex::new(State::Unloaded) })
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    // Mutations commit only after a successful save, so a poisoned guard
    // still holds a consistent state.
    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> ReconcilerState {
        match &*self.lock() {
            State::Unloaded => ReconcilerState::Unloaded,
            State::Ready(_) => ReconcilerState::Ready,
            State::LoadFailed { .. } => ReconcilerState::LoadFailed,
        }
    }

    /// Reason of the failed load when the controller is in `LoadFailed`.
    #[must_use]
    pub fn load_failure(&self) -> Option<(PathBuf, String)> {
        match &*self.lock() {
            State::LoadFailed { path, reason } => Some((path.clone(), reason.clone())),
            State::Unloaded | State::Ready(_) => None,
        }
    }

    /// Open, index, and check the document at `path`.
    ///
    /// # Errors
    /// Returns [`ReconcileError::LoadFailed`] for non-`.xml` paths and
    /// unreadable or malformed documents, and
    /// [`ReconcileError::UnresolvableReference`] under the `fail` policy.
    /// A previously loaded document stays loaded when this fails.
    pub fn load(&self, path: &Path) -> Result<CheckReport, ReconcileError> {
        let mut state = self.lock();
        if !has_xml_extension(path) {
            let err = ReconcileError::LoadFailed(format!(
                "expected an .xml document, got {}",
                path.display()
            ));
            Self::record_load_failure(&mut state, path, &err);
            return Err(err);
        }

        match S::open(path) {
            Ok(store) => self.install(&mut state, store),
            Err(err) => {
                Self::record_load_failure(&mut state, path, &err);
                Err(err)
            }
        }
    }

    /// Check an already-opened store and make it the current document.
    ///
    /// # Errors
    /// Returns [`ReconcileError::UnresolvableReference`] under the `fail` policy.
    pub fn load_store(&self, store: S) -> Result<CheckReport, ReconcileError> {
        let mut state = self.lock();
        self.install(&mut state, store)
    }

    fn install(&self, state: &mut State<S>, store: S) -> Result<CheckReport, ReconcileError> {
        let outcome = match check(store.records(), &self.schema) {
            Ok(outcome) => outcome,
            Err(err) => {
                Self::record_load_failure(state, store.location(), &err);
                return Err(err);
            }
        };

        for entry in &outcome.unresolved {
            tracing::warn!("{}: {entry}", store.location().display());
        }
        tracing::info!(
            "Checked {}: {} orphan links in {} groups, {} unresolved",
            store.location().display(),
            outcome.orphan_link_count,
            outcome.groups.len(),
            outcome.unresolved.len()
        );

        let session = Session { store, outcome, checked_at: OffsetDateTime::now_utc() };
        let report = session.report();
        *state = State::Ready(session);
        Ok(report)
    }

    fn record_load_failure(state: &mut State<S>, path: &Path, err: &ReconcileError) {
        tracing::warn!("Failed to load {}: {err}", path.display());
        if !matches!(state, State::Ready(_)) {
            *state = State::LoadFailed { path: path.to_path_buf(), reason: err.to_string() };
        }
    }

    #[must_use]
    pub fn report(&self) -> Option<CheckReport> {
        match &*self.lock() {
            State::Ready(session) => Some(session.report()),
            State::Unloaded | State::LoadFailed { .. } => None,
        }
    }

    #[must_use]
    pub fn groups(&self) -> Vec<OrphanGroup> {
        match &*self.lock() {
            State::Ready(session) => session.outcome.groups.as_slice().to_vec(),
            State::Unloaded | State::LoadFailed { .. } => Vec::new(),
        }
    }

    #[must_use]
    pub fn document_path(&self) -> Option<PathBuf> {
        match &*self.lock() {
            State::Ready(session) => Some(session.store.location().to_path_buf()),
            State::Unloaded | State::LoadFailed { .. } => None,
        }
    }

    /// Remove every link record owned by `owner_key`, persist, then drop the
    /// key from the orphan groups.
    ///
    /// # Errors
    /// Returns [`ReconcileError::NotLoaded`] before a successful load,
    /// [`ReconcileError::NotFound`] when no group holds the key, and
    /// [`ReconcileError::PersistenceFailed`] when the write fails, in which
    /// case nothing changes.
    pub fn remove_owner_key(&self, owner_key: &str) -> Result<RemovalOutcome, ReconcileError> {
        let mut state = self.lock();
        let State::Ready(session) = &mut *state else {
            return Err(ReconcileError::NotLoaded);
        };
        if session.outcome.groups.is_empty() {
            tracing::debug!("No orphan groups left; ignoring removal of {owner_key}");
            return Ok(RemovalOutcome::default());
        }
        if !session.outcome.groups.contains_owner_key(owner_key) {
            return Err(ReconcileError::NotFound(owner_key.to_string()));
        }

        let mut store = session.store.clone();
        let mut outcome = session.outcome.clone();
        let removed_links =
            store.remove_record(&self.schema.link.tag, &self.schema.link.owner_key, owner_key);
        let removal = outcome.record_removal(owner_key, removed_links)?;
        if let Err(err) = store.save() {
            tracing::warn!("Rolled back removal of {owner_key}: {err}");
            return Err(err);
        }

        session.store = store;
        session.outcome = outcome;
        tracing::info!(
            "Removed {removed_links} link records for {owner_key} from {}",
            session.store.location().display()
        );

        Ok(RemovalOutcome {
            removed_links,
            removed_owner_keys: vec![removal.owner_key],
            dropped_groups: removal.dropped_groups,
            persisted: true,
        })
    }

    /// Remove the link records of every grouped owner key with one write.
    ///
    /// # Errors
    /// Returns [`ReconcileError::NotLoaded`] before a successful load and
    /// [`ReconcileError::PersistenceFailed`] when the write fails, in which
    /// case nothing changes.
    pub fn remove_all(&self) -> Result<RemovalOutcome, ReconcileError> {
        let mut state = self.lock();
        let State::Ready(session) = &mut *state else {
            return Err(ReconcileError::NotLoaded);
        };
        if session.outcome.groups.is_empty() {
            tracing::debug!("No orphan groups left; nothing to purge");
            return Ok(RemovalOutcome::default());
        }

        let mut store = session.store.clone();
        let mut outcome = session.outcome.clone();
        let owner_keys =
            outcome.groups.owner_keys().into_iter().map(ToString::to_string).collect::<Vec<_>>();

        let mut removed_links = 0;
        let mut dropped_groups = Vec::new();
        for owner_key in &owner_keys {
            let removed =
                store.remove_record(&self.schema.link.tag, &self.schema.link.owner_key, owner_key);
            tracing::debug!("Staged removal of {removed} link records for {owner_key}");
            let removal = outcome.record_removal(owner_key, removed)?;
            removed_links += removed;
            dropped_groups.extend(removal.dropped_groups);
        }
        outcome.groups.clear();

        if let Err(err) = store.save() {
            tracing::warn!("Rolled back purge of {} owner keys: {err}", owner_keys.len());
            return Err(err);
        }

        session.store = store;
        session.outcome = outcome;
        tracing::info!(
            "Purged {removed_links} link records for {} owner keys from {}",
            owner_keys.len(),
            session.store.location().display()
        );

        Ok(RemovalOutcome {
            removed_links,
            removed_owner_keys: owner_keys,
            dropped_groups,
            persisted: true,
        })
    }

    /// Hand the current document to `launcher` after checking it still exists.
    ///
    /// # Errors
    /// Returns [`ReconcileError::NotLoaded`] before a successful load and
    /// [`ReconcileError::LaunchFailed`] when the file is gone or the launcher fails.
    pub fn open_in_viewer(&self, launcher: &dyn Launcher) -> Result<PathBuf, ReconcileError> {
        let path = self.document_path().ok_or(ReconcileError::NotLoaded)?;
        if !path.is_file() {
            return Err(ReconcileError::LaunchFailed(format!(
                "document {} no longer exists",
                path.display()
            )));
        }
        launcher.launch(&path).map_err(|err| {
            ReconcileError::LaunchFailed(format!("failed to open {}: {err}", path.display()))
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use refcheck_core::{FieldSelector, Record, ReferenceHop, UnresolvedPolicy};
    use ulid::Ulid;

    use super::*;

    const EXAMPLE: &str = r"<?xml version='1.0' encoding='utf-8'?>
<Configuration>
  <Parameters><Id>P1</Id><Name>Temperature</Name></Parameters>
  <ParameterDiscreteSet><ParameterId>P2</ParameterId><DiscreteSetValueId>V1</DiscreteSetValueId></ParameterDiscreteSet>
  <ParameterDiscreteSet><ParameterId>P3</ParameterId><DiscreteSetValueId>V2</DiscreteSetValueId></ParameterDiscreteSet>
  <ParameterDiscreteSet><ParameterId>P4</ParameterId><DiscreteSetValueId>V1</DiscreteSetValueId></ParameterDiscreteSet>
  <DiscreteSetValue><Id>V1</Id><DiscreteSetId>G1</DiscreteSetId></DiscreteSetValue>
  <DiscreteSetValue><Id>V2</Id><DiscreteSetId>G2</DiscreteSetId></DiscreteSetValue>
  <DiscreteSet><Id>G1</Id><Name>Alpha</Name></DiscreteSet>
  <DiscreteSet><Id>G2</Id><Name>Beta</Name></DiscreteSet>
</Configuration>
";

    const CLEAN: &str = r"<Configuration>
  <Parameters><Id>P1</Id></Parameters>
  <ParameterDiscreteSet><ParameterId>P1</ParameterId><DiscreteSetValueId>V1</DiscreteSetValueId></ParameterDiscreteSet>
</Configuration>
";

    fn temp_document(contents: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("refcheck-api-{}", Ulid::new()));
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create temp dir {}", dir.display()))?;
        let path = dir.join("configuration.xml");
        fs::write(&path, contents)
            .with_context(|| format!("failed to write fixture {}", path.display()))?;
        Ok(path)
    }

    fn cleanup(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::remove_dir_all(dir)
                .with_context(|| format!("failed to cleanup temp dir {}", dir.display()))?;
        }
        Ok(())
    }

    fn new_reconciler() -> Result<Reconciler> {
        Ok(Reconciler::new(Schema::default())?)
    }

    fn group_keys(groups: &[OrphanGroup]) -> Vec<(String, Vec<String>)> {
        groups.iter().map(|group| (group.group_id.clone(), group.owner_keys.clone())).collect()
    }

    fn owned(id: &str, keys: &[&str]) -> (String, Vec<String>) {
        (id.to_string(), keys.iter().map(ToString::to_string).collect())
    }

    fn link_owners(path: &Path) -> Result<Vec<String>> {
        let store = XmlDocumentStore::load(path)?;
        Ok(store
            .records()
            .iter()
            .filter(|record| record.kind == "ParameterDiscreteSet")
            .map(|record| record.key(&FieldSelector::First).to_string())
            .collect())
    }

    #[test]
    fn load_groups_orphans_by_discrete_set() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let reconciler = new_reconciler()?;
        assert_eq!(reconciler.state(), ReconcilerState::Unloaded);

        let report = reconciler.load(&path)?;
        assert_eq!(reconciler.state(), ReconcilerState::Ready);
        assert_eq!(report.document, path);
        assert!(report.document_sha256.as_deref().is_some_and(|d| d.starts_with("sha256:")));
        assert_eq!(report.entity_count, 1);
        assert_eq!(report.link_count, 3);
        assert_eq!(report.orphan_link_count, 3);
        assert_eq!(
            group_keys(&report.orphan_groups),
            vec![owned("G1", &["P2", "P4"]), owned("G2", &["P3"])]
        );
        assert_eq!(report.orphan_groups[0].group_name, "Alpha");
        assert_eq!(report.orphan_groups[1].group_name, "Beta");
        assert!(report.unresolved.is_empty());

        cleanup(&path)
    }

    #[test]
    fn reloading_an_unmodified_document_is_idempotent() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let reconciler = new_reconciler()?;

        let first = reconciler.load(&path)?;
        let second = reconciler.load(&path)?;
        assert_eq!(first.orphan_groups, second.orphan_groups);
        assert_eq!(first.document_sha256, second.document_sha256);
        assert_eq!(
            serde_json::to_string(&first.orphan_groups)?,
            serde_json::to_string(&second.orphan_groups)?
        );

        cleanup(&path)
    }

    #[test]
    fn removing_owner_keys_updates_groups_and_document() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let reconciler = new_reconciler()?;
        reconciler.load(&path)?;

        let outcome = reconciler.remove_owner_key("P2")?;
        assert_eq!(outcome.removed_links, 1);
        assert!(outcome.dropped_groups.is_empty());
        assert!(outcome.persisted);
        assert_eq!(
            group_keys(&reconciler.groups()),
            vec![owned("G1", &["P4"]), owned("G2", &["P3"])]
        );
        assert_eq!(link_owners(&path)?, vec!["P3".to_string(), "P4".to_string()]);

        let fresh = new_reconciler()?;
        let reloaded = fresh.load(&path)?;
        assert!(reloaded
            .orphan_groups
            .iter()
            .all(|group| group.owner_keys.iter().all(|key| key != "P2")));

        let outcome = reconciler.remove_owner_key("P4")?;
        assert_eq!(outcome.dropped_groups, vec!["G1".to_string()]);
        assert_eq!(group_keys(&reconciler.groups()), vec![owned("G2", &["P3"])]);

        let report = reconciler.report().context("report should exist while ready")?;
        assert_eq!(report.link_count, 1);
        assert_eq!(report.orphan_link_count, 1);

        cleanup(&path)
    }

    #[test]
    fn removing_an_untracked_key_is_not_found_and_leaves_everything() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let reconciler = new_reconciler()?;
        reconciler.load(&path)?;
        let before_groups = reconciler.groups();
        let before_bytes = fs::read(&path)?;

        for key in ["P1", "P404"] {
            assert_eq!(
                reconciler.remove_owner_key(key),
                Err(ReconcileError::NotFound(key.to_string()))
            );
        }
        assert_eq!(reconciler.groups(), before_groups);
        assert_eq!(fs::read(&path)?, before_bytes);

        cleanup(&path)
    }

    #[test]
    fn remove_all_purges_groups_and_reload_stays_empty() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let reconciler = new_reconciler()?;
        reconciler.load(&path)?;

        let outcome = reconciler.remove_all()?;
        assert_eq!(outcome.removed_links, 3);
        assert_eq!(
            outcome.removed_owner_keys,
            vec!["P2".to_string(), "P4".to_string(), "P3".to_string()]
        );
        assert_eq!(outcome.dropped_groups, vec!["G1".to_string(), "G2".to_string()]);
        assert!(reconciler.groups().is_empty());

        let reloaded = reconciler.load(&path)?;
        assert!(reloaded.orphan_groups.is_empty());
        assert_eq!(reloaded.entity_count, 1);
        let store = XmlDocumentStore::load(&path)?;
        assert_eq!(store.records().len(), 5);

        cleanup(&path)
    }

    #[test]
    fn removals_on_empty_group_sequence_are_no_ops() -> Result<()> {
        let path = temp_document(CLEAN)?;
        let reconciler = new_reconciler()?;
        let report = reconciler.load(&path)?;
        assert!(report.orphan_groups.is_empty());
        let before_bytes = fs::read(&path)?;

        assert_eq!(reconciler.remove_owner_key("P1")?, RemovalOutcome::default());
        assert_eq!(reconciler.remove_all()?, RemovalOutcome::default());
        assert_eq!(fs::read(&path)?, before_bytes);

        cleanup(&path)
    }

    #[test]
    fn removals_before_load_report_not_loaded() -> Result<()> {
        let reconciler = new_reconciler()?;
        assert_eq!(reconciler.remove_owner_key("P2"), Err(ReconcileError::NotLoaded));
        assert_eq!(reconciler.remove_all(), Err(ReconcileError::NotLoaded));
        assert!(reconciler.report().is_none());
        assert!(reconciler.groups().is_empty());
        Ok(())
    }

    #[test]
    fn non_xml_and_missing_paths_fail_to_load() -> Result<()> {
        let reconciler = new_reconciler()?;

        let err = reconciler.load(Path::new("configuration.json"));
        assert!(matches!(err, Err(ReconcileError::LoadFailed(message)) if message.contains(".xml")));
        assert_eq!(reconciler.state(), ReconcilerState::LoadFailed);

        let missing = std::env::temp_dir().join(format!("refcheck-missing-{}.XML", Ulid::new()));
        assert!(matches!(reconciler.load(&missing), Err(ReconcileError::LoadFailed(_))));
        let (failed_path, reason) =
            reconciler.load_failure().context("load failure should be recorded")?;
        assert_eq!(failed_path, missing);
        assert!(reason.contains("failed to read document"));
        Ok(())
    }

    #[test]
    fn uppercase_xml_extension_loads() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let upper = path.with_file_name("CONFIGURATION.XML");
        fs::rename(&path, &upper)?;
        let reconciler = new_reconciler()?;

        let report = reconciler.load(&upper)?;
        assert_eq!(reconciler.state(), ReconcilerState::Ready);
        assert_eq!(report.orphan_groups.len(), 2);
        assert!(matches!(
            reconciler.load(&upper.with_file_name("configuration.xmlx")),
            Err(ReconcileError::LoadFailed(message)) if message.contains("expected an .xml")
        ));

        cleanup(&upper)
    }

    #[test]
    fn failed_reload_keeps_the_loaded_document() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let broken = temp_document("<Configuration><Parameter>")?;
        let reconciler = new_reconciler()?;
        reconciler.load(&path)?;
        let before = reconciler.groups();

        assert!(matches!(reconciler.load(&broken), Err(ReconcileError::LoadFailed(_))));
        assert_eq!(reconciler.state(), ReconcilerState::Ready);
        assert_eq!(reconciler.groups(), before);
        assert_eq!(reconciler.document_path(), Some(path.clone()));

        cleanup(&broken)?;
        cleanup(&path)
    }

    #[derive(Debug, Clone)]
    struct FlakyStore {
        inner: XmlDocumentStore,
        fail_saves: Arc<AtomicBool>,
    }

    impl DocumentStore for FlakyStore {
        fn open(path: &Path) -> Result<Self, ReconcileError> {
            Ok(Self { inner: XmlDocumentStore::open(path)?, fail_saves: Arc::default() })
        }

        fn location(&self) -> &Path {
            self.inner.location()
        }

        fn records(&self) -> &[Record] {
            self.inner.records()
        }

        fn remove_record(&mut self, kind: &str, selector: &FieldSelector, key: &str) -> usize {
            self.inner.remove_record(kind, selector, key)
        }

        fn save(&mut self) -> Result<(), ReconcileError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(ReconcileError::PersistenceFailed("disk is full".to_string()));
            }
            self.inner.save()
        }
    }

    #[test]
    fn persistence_failure_rolls_back_in_memory_state() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let fail_saves = Arc::new(AtomicBool::new(true));
        let store = FlakyStore {
            inner: XmlDocumentStore::load(&path)?,
            fail_saves: Arc::clone(&fail_saves),
        };
        let reconciler = Reconciler::<FlakyStore>::new(Schema::default())?;
        reconciler.load_store(store)?;
        let before_groups = reconciler.groups();
        let before_bytes = fs::read(&path)?;

        assert!(matches!(
            reconciler.remove_owner_key("P2"),
            Err(ReconcileError::PersistenceFailed(_))
        ));
        assert!(matches!(reconciler.remove_all(), Err(ReconcileError::PersistenceFailed(_))));
        assert_eq!(reconciler.groups(), before_groups);
        assert_eq!(fs::read(&path)?, before_bytes);
        assert_eq!(reconciler.report().map(|report| report.link_count), Some(3));

        fail_saves.store(false, Ordering::SeqCst);
        let outcome = reconciler.remove_owner_key("P2")?;
        assert_eq!(outcome.removed_links, 1);
        assert_eq!(link_owners(&path)?, vec!["P3".to_string(), "P4".to_string()]);

        cleanup(&path)
    }

    #[test]
    fn unresolved_references_are_reported_or_fail_by_policy() -> Result<()> {
        let broken = EXAMPLE.replace(
            "<DiscreteSetValue><Id>V2</Id><DiscreteSetId>G2</DiscreteSetId></DiscreteSetValue>",
            "<DiscreteSetValue><Id>V2</Id><DiscreteSetId>G9</DiscreteSetId></DiscreteSetValue>",
        );
        let path = temp_document(&broken)?;

        let reporting = new_reconciler()?;
        let report = reporting.load(&path)?;
        assert_eq!(group_keys(&report.orphan_groups), vec![owned("G1", &["P2", "P4"])]);
        assert_eq!(
            report.unresolved,
            vec![UnresolvedReference {
                owner_key: "P3".to_string(),
                hop: ReferenceHop::GroupRecord,
                missing_key: "G9".to_string(),
            }]
        );
        assert_eq!(
            reporting.remove_owner_key("P3"),
            Err(ReconcileError::NotFound("P3".to_string()))
        );

        let strict = Reconciler::<XmlDocumentStore>::new(Schema {
            unresolved: UnresolvedPolicy::Fail,
            ..Schema::default()
        })?;
        assert!(matches!(
            strict.load(&path),
            Err(ReconcileError::UnresolvableReference(entry)) if entry.owner_key == "P3"
        ));
        assert_eq!(strict.state(), ReconcilerState::LoadFailed);

        cleanup(&path)
    }

    #[derive(Debug, Default)]
    struct RecordingLauncher {
        opened: Mutex<Vec<PathBuf>>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, path: &Path) -> std::io::Result<()> {
            self.opened.lock().unwrap_or_else(PoisonError::into_inner).push(path.to_path_buf());
            Ok(())
        }
    }

    #[test]
    fn open_in_viewer_requires_an_existing_document() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let reconciler = new_reconciler()?;
        let launcher = RecordingLauncher::default();
        assert_eq!(reconciler.open_in_viewer(&launcher), Err(ReconcileError::NotLoaded));

        reconciler.load(&path)?;
        assert_eq!(reconciler.open_in_viewer(&launcher)?, path);
        assert_eq!(
            *launcher.opened.lock().unwrap_or_else(PoisonError::into_inner),
            vec![path.clone()]
        );

        cleanup(&path)?;
        assert!(matches!(
            reconciler.open_in_viewer(&launcher),
            Err(ReconcileError::LaunchFailed(message)) if message.contains("no longer exists")
        ));
        Ok(())
    }

    #[test]
    fn concurrent_removals_are_serialized() -> Result<()> {
        let path = temp_document(EXAMPLE)?;
        let reconciler = new_reconciler()?;
        reconciler.load(&path)?;

        let results = std::thread::scope(|scope| {
            let handles = ["P2", "P3", "P4"]
                .into_iter()
                .map(|key| {
                    let reconciler = &reconciler;
                    scope.spawn(move || reconciler.remove_owner_key(key))
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(|handle| handle.join()).collect::<Vec<_>>()
        });
        for result in results {
            match result {
                Ok(Ok(outcome)) => assert_eq!(outcome.removed_links, 1),
                Ok(Err(err)) => panic!("removal should succeed: {err}"),
                Err(_) => panic!("removal thread panicked"),
            }
        }

        assert!(reconciler.groups().is_empty());
        assert!(link_owners(&path)?.is_empty());
        assert!(reconciler.load(&path)?.orphan_groups.is_empty());

        cleanup(&path)
    }
}
