use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Selector spelling for "the record's first field element".
pub const FIRST_FIELD_SELECTOR: &str = "@first";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("load failed: {0}")]
    LoadFailed(String),
    #[error("unresolvable reference: {0}")]
    UnresolvableReference(UnresolvedReference),
    #[error("owner key is not a tracked orphan: {0}")]
    NotFound(String),
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),
    #[error("no document is loaded")]
    NotLoaded,
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceHop {
    ValueRecord,
    GroupRecord,
}

impl ReferenceHop {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValueRecord => "value_record",
            Self::GroupRecord => "group_record",
        }
    }
}

/// An orphan link whose value or group reference leads nowhere.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnresolvedReference {
    pub owner_key: String,
    pub hop: ReferenceHop,
    pub missing_key: String,
}

impl Display for UnresolvedReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "orphan link `{}` points at missing {} `{}`",
            self.owner_key,
            self.hop.as_str(),
            self.missing_key
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// One top-level child of the document root.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<Field>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Record {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), attributes: Vec::new(), fields: Vec::new() }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(Field::new(name, value));
        self
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|field| field.name == name).map(|field| field.value.as_str())
    }

    #[must_use]
    pub fn first_field(&self) -> Option<&str> {
        self.fields.first().map(|field| field.value.as_str())
    }

    #[must_use]
    pub fn select(&self, selector: &FieldSelector) -> Option<&str> {
        match selector {
            FieldSelector::First => self.first_field(),
            FieldSelector::Named(name) => self.field(name),
        }
    }

    /// Selected key value; an absent field reads as the empty string.
    #[must_use]
    pub fn key(&self, selector: &FieldSelector) -> &str {
        self.select(selector).unwrap_or("")
    }

    #[must_use]
    pub fn matches(&self, kind: &str, selector: &FieldSelector, key: &str) -> bool {
        self.kind == kind && self.key(selector) == key
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "String", into = "String")]
pub enum FieldSelector {
    First,
    Named(String),
}

impl FieldSelector {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::First => FIRST_FIELD_SELECTOR,
            Self::Named(name) => name,
        }
    }
}

impl From<String> for FieldSelector {
    fn from(value: String) -> Self {
        if value == FIRST_FIELD_SELECTOR {
            Self::First
        } else {
            Self::Named(value)
        }
    }
}

impl From<FieldSelector> for String {
    fn from(value: FieldSelector) -> Self {
        match value {
            FieldSelector::First => FIRST_FIELD_SELECTOR.to_string(),
            FieldSelector::Named(name) => name,
        }
    }
}

impl Display for FieldSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EntityKind {
    pub tag: String,
    pub id: FieldSelector,
}

impl Default for EntityKind {
    fn default() -> Self {
        Self { tag: "Parameters".to_string(), id: FieldSelector::First }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LinkKind {
    pub tag: String,
    pub owner_key: FieldSelector,
    pub target_value_key: FieldSelector,
}

impl Default for LinkKind {
    fn default() -> Self {
        Self {
            tag: "ParameterDiscreteSet".to_string(),
            owner_key: FieldSelector::First,
            target_value_key: FieldSelector::named("DiscreteSetValueId"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ValueKind {
    pub tag: String,
    pub id: FieldSelector,
    pub group_key: FieldSelector,
}

impl Default for ValueKind {
    fn default() -> Self {
        Self {
            tag: "DiscreteSetValue".to_string(),
            id: FieldSelector::named("Id"),
            group_key: FieldSelector::named("DiscreteSetId"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GroupKind {
    pub tag: String,
    pub id: FieldSelector,
    pub name: FieldSelector,
}

impl Default for GroupKind {
    fn default() -> Self {
        Self {
            tag: "DiscreteSet".to_string(),
            id: FieldSelector::named("Id"),
            name: FieldSelector::named("Name"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Exclude the orphan from grouping and list it in the outcome.
    #[default]
    Report,
    /// Fail the whole check on the first unresolvable reference.
    Fail,
}

/// Tag names and key selectors for the four record kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Schema {
    pub entity: EntityKind,
    pub link: LinkKind,
    pub value: ValueKind,
    pub group: GroupKind,
    pub unresolved: UnresolvedPolicy,
}

impl Schema {
    /// Parse a schema from YAML; omitted sections keep their defaults.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidSchema`] when the YAML is malformed or
    /// the resulting schema fails [`Schema::validate`].
    pub fn from_yaml_str(raw: &str) -> Result<Self, ReconcileError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let schema: Self = serde_yaml::from_str(raw).map_err(|err| {
            ReconcileError::InvalidSchema(format!("failed to parse schema YAML: {err}"))
        })?;
        schema.validate()?;
        Ok(schema)
    }

    /// # Errors
    /// Returns [`ReconcileError::InvalidSchema`] when YAML serialization fails.
    pub fn to_yaml_string(&self) -> Result<String, ReconcileError> {
        serde_yaml::to_string(self).map_err(|err| {
            ReconcileError::InvalidSchema(format!("failed to serialize schema YAML: {err}"))
        })
    }

    /// Check that every tag is set, tags are pairwise distinct, and named
    /// selectors are non-empty.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidSchema`] describing the first violation.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        let tags = [
            ("entity", &self.entity.tag),
            ("link", &self.link.tag),
            ("value", &self.value.tag),
            ("group", &self.group.tag),
        ];
        let mut seen = HashSet::new();
        for (section, tag) in tags {
            if tag.trim().is_empty() {
                return Err(ReconcileError::InvalidSchema(format!(
                    "{section}.tag MUST be non-empty"
                )));
            }
            if !seen.insert(tag.as_str()) {
                return Err(ReconcileError::InvalidSchema(format!(
                    "{section}.tag `{tag}` is already used by another record kind"
                )));
            }
        }

        let selectors = [
            ("entity.id", &self.entity.id),
            ("link.owner_key", &self.link.owner_key),
            ("link.target_value_key", &self.link.target_value_key),
            ("value.id", &self.value.id),
            ("value.group_key", &self.value.group_key),
            ("group.id", &self.group.id),
            ("group.name", &self.group.name),
        ];
        for (path, selector) in selectors {
            if let FieldSelector::Named(name) = selector {
                if name.trim().is_empty() {
                    return Err(ReconcileError::InvalidSchema(format!(
                        "{path} MUST name a field or be {FIRST_FIELD_SELECTOR}"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Records grouped by kind, each list in document order.
#[derive(Debug, Clone, Default)]
pub struct RecordIndex<'a> {
    by_kind: HashMap<&'a str, Vec<&'a Record>>,
    kinds: Vec<&'a str>,
    total: usize,
}

impl<'a> RecordIndex<'a> {
    #[must_use]
    pub fn build(records: &'a [Record]) -> Self {
        let mut index = Self::default();
        for record in records {
            let kind = record.kind.as_str();
            let bucket = index.by_kind.entry(kind).or_default();
            if bucket.is_empty() {
                index.kinds.push(kind);
            }
            bucket.push(record);
            index.total += 1;
        }
        index
    }

    #[must_use]
    pub fn records_of(&self, kind: &str) -> &[&'a Record] {
        match self.by_kind.get(kind) {
            Some(records) => records,
            None => &[],
        }
    }

    /// Kinds in order of first appearance.
    #[must_use]
    pub fn kinds(&self) -> &[&'a str] {
        &self.kinds
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrphanLink<'a> {
    pub record: &'a Record,
    pub owner_key: &'a str,
    /// Position among the link records of the document.
    pub link_position: usize,
}

/// Links whose owner key matches no entity id, in document order.
#[must_use]
pub fn find_orphan_links<'a>(index: &RecordIndex<'a>, schema: &Schema) -> Vec<OrphanLink<'a>> {
    let entity_ids = index
        .records_of(&schema.entity.tag)
        .iter()
        .copied()
        .map(|entity| entity.key(&schema.entity.id))
        .collect::<HashSet<&str>>();

    index
        .records_of(&schema.link.tag)
        .iter()
        .copied()
        .enumerate()
        .filter_map(|(link_position, record)| {
            let owner_key = record.key(&schema.link.owner_key);
            (!entity_ids.contains(owner_key)).then_some(OrphanLink {
                record,
                owner_key,
                link_position,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrphanGroup {
    pub group_id: String,
    pub group_name: String,
    pub owner_keys: Vec<String>,
}

/// Orphan groups in first-encounter order. Groups are never empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct OrphanGroups(Vec<OrphanGroup>);

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GroupRemoval {
    pub owner_key: String,
    pub touched_groups: Vec<String>,
    pub dropped_groups: Vec<String>,
}

impl OrphanGroups {
    #[must_use]
    pub fn as_slice(&self) -> &[OrphanGroup] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OrphanGroup> {
        self.0.iter()
    }

    #[must_use]
    pub fn get(&self, group_id: &str) -> Option<&OrphanGroup> {
        self.0.iter().find(|group| group.group_id == group_id)
    }

    #[must_use]
    pub fn contains_owner_key(&self, owner_key: &str) -> bool {
        self.0.iter().any(|group| group.owner_keys.iter().any(|key| key == owner_key))
    }

    /// Distinct owner keys across all groups, first-seen order.
    #[must_use]
    pub fn owner_keys(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.0
            .iter()
            .flat_map(|group| group.owner_keys.iter())
            .map(String::as_str)
            .filter(|key| seen.insert(*key))
            .collect()
    }

    /// Drop `owner_key` from every group holding it; groups left empty go away.
    ///
    /// # Errors
    /// Returns [`ReconcileError::NotFound`] when no group holds the key.
    pub fn remove_owner_key(&mut self, owner_key: &str) -> Result<GroupRemoval, ReconcileError> {
        if !self.contains_owner_key(owner_key) {
            return Err(ReconcileError::NotFound(owner_key.to_string()));
        }

        let mut touched_groups = Vec::new();
        let mut dropped_groups = Vec::new();
        for group in &mut self.0 {
            let before = group.owner_keys.len();
            group.owner_keys.retain(|key| key != owner_key);
            if group.owner_keys.len() == before {
                continue;
            }
            touched_groups.push(group.group_id.clone());
            if group.owner_keys.is_empty() {
                dropped_groups.push(group.group_id.clone());
            }
        }
        self.0.retain(|group| !group.owner_keys.is_empty());

        Ok(GroupRemoval { owner_key: owner_key.to_string(), touched_groups, dropped_groups })
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<OrphanGroup> {
        self.0
    }
}

impl<'a> IntoIterator for &'a OrphanGroups {
    type Item = &'a OrphanGroup;
    type IntoIter = std::slice::Iter<'a, OrphanGroup>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Default)]
struct GroupAccumulator {
    groups: Vec<OrphanGroup>,
    positions: HashMap<String, usize>,
}

impl GroupAccumulator {
    fn push(&mut self, group_id: &str, group_name: &str, owner_key: &str) {
        let position = if let Some(position) = self.positions.get(group_id) {
            *position
        } else {
            let position = self.groups.len();
            self.groups.push(OrphanGroup {
                group_id: group_id.to_string(),
                group_name: group_name.to_string(),
                owner_keys: Vec::new(),
            });
            self.positions.insert(group_id.to_string(), position);
            position
        };

        let group = &mut self.groups[position];
        if !group.owner_keys.iter().any(|key| key == owner_key) {
            group.owner_keys.push(owner_key.to_string());
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Aggregation {
    pub groups: OrphanGroups,
    pub unresolved: Vec<UnresolvedReference>,
}

fn lookup_table<'a>(
    records: &[&'a Record],
    selector: &FieldSelector,
) -> HashMap<&'a str, &'a Record> {
    let mut table = HashMap::with_capacity(records.len());
    for record in records.iter().copied() {
        table.entry(record.key(selector)).or_insert(record);
    }
    table
}

/// Group orphan links under the group record their value record belongs to.
///
/// Orphans whose value or group cannot be resolved are listed in
/// [`Aggregation::unresolved`] instead of being grouped.
#[must_use]
pub fn aggregate(
    orphans: &[OrphanLink<'_>],
    index: &RecordIndex<'_>,
    schema: &Schema,
) -> Aggregation {
    let values = lookup_table(index.records_of(&schema.value.tag), &schema.value.id);
    let groups = lookup_table(index.records_of(&schema.group.tag), &schema.group.id);

    let mut accumulator = GroupAccumulator::default();
    let mut unresolved = Vec::new();
    for orphan in orphans {
        let value_key = orphan.record.key(&schema.link.target_value_key);
        let Some(value) = values.get(value_key) else {
            unresolved.push(UnresolvedReference {
                owner_key: orphan.owner_key.to_string(),
                hop: ReferenceHop::ValueRecord,
                missing_key: value_key.to_string(),
            });
            continue;
        };

        let group_key = value.key(&schema.value.group_key);
        let Some(group) = groups.get(group_key) else {
            unresolved.push(UnresolvedReference {
                owner_key: orphan.owner_key.to_string(),
                hop: ReferenceHop::GroupRecord,
                missing_key: group_key.to_string(),
            });
            continue;
        };

        accumulator.push(group_key, group.key(&schema.group.name), orphan.owner_key);
    }

    Aggregation { groups: OrphanGroups(accumulator.groups), unresolved }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CheckOutcome {
    pub entity_count: usize,
    pub link_count: usize,
    pub distinct_link_owner_count: usize,
    pub orphan_link_count: usize,
    pub groups: OrphanGroups,
    pub unresolved: Vec<UnresolvedReference>,
}

impl CheckOutcome {
    /// Account for `removed_links` link records of `owner_key` having left the
    /// document.
    ///
    /// # Errors
    /// Returns [`ReconcileError::NotFound`] when no group holds the key.
    pub fn record_removal(
        &mut self,
        owner_key: &str,
        removed_links: usize,
    ) -> Result<GroupRemoval, ReconcileError> {
        let removal = self.groups.remove_owner_key(owner_key)?;
        self.unresolved.retain(|entry| entry.owner_key != owner_key);
        self.link_count = self.link_count.saturating_sub(removed_links);
        self.orphan_link_count = self.orphan_link_count.saturating_sub(removed_links);
        if removed_links > 0 {
            self.distinct_link_owner_count = self.distinct_link_owner_count.saturating_sub(1);
        }
        Ok(removal)
    }
}

/// Run index, orphan detection, and aggregation over one document's records.
///
/// # Errors
/// Returns [`ReconcileError::UnresolvableReference`] for the first unresolved
/// orphan when the schema policy is [`UnresolvedPolicy::Fail`].
pub fn check(records: &[Record], schema: &Schema) -> Result<CheckOutcome, ReconcileError> {
    let index = RecordIndex::build(records);
    let orphans = find_orphan_links(&index, schema);
    let aggregation = aggregate(&orphans, &index, schema);

    if schema.unresolved == UnresolvedPolicy::Fail {
        if let Some(first) = aggregation.unresolved.first() {
            return Err(ReconcileError::UnresolvableReference(first.clone()));
        }
    }

    let links = index.records_of(&schema.link.tag);
    let distinct_link_owner_count = links
        .iter()
        .map(|link| link.key(&schema.link.owner_key))
        .collect::<HashSet<_>>()
        .len();

    Ok(CheckOutcome {
        entity_count: index.records_of(&schema.entity.tag).len(),
        link_count: links.len(),
        distinct_link_owner_count,
        orphan_link_count: orphans.len(),
        groups: aggregation.groups,
        unresolved: aggregation.unresolved,
    })
}

/// Persistence seam between the reconciliation controller and a document format.
///
/// Implementations are cloned to stage removals: the controller mutates a
/// copy, saves it, and only then replaces the original.
pub trait DocumentStore: Clone {
    /// # Errors
    /// Returns [`ReconcileError::LoadFailed`] when the document cannot be read
    /// or parsed.
    fn open(path: &Path) -> Result<Self, ReconcileError>;

    fn location(&self) -> &Path;

    fn records(&self) -> &[Record];

    /// Remove every record of `kind` whose selected key equals `key`; returns
    /// the number removed.
    fn remove_record(&mut self, kind: &str, selector: &FieldSelector, key: &str) -> usize;

    /// Rewrite the whole document to [`DocumentStore::location`].
    ///
    /// # Errors
    /// Returns [`ReconcileError::PersistenceFailed`] when the write fails.
    fn save(&mut self) -> Result<(), ReconcileError>;

    fn content_digest(&self) -> Option<&str> {
        None
    }
}
