//! Table registry: the single source of truth for sync table names, row
//! schemas, snake/camel field maps, conflict targets and the dependency
//! graph. Every consumer (push applier, pull producer, ledger engine,
//! client apply, consistency diffing) iterates the same ordered entries.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::OnceLock;
use uuid::Uuid;

/// Envelope fields carried by every sync row, `(wire, local-db)` names.
pub const ENVELOPE_FIELDS: &[(&str, &str)] = &[
    ("id", "id"),
    ("created_at", "createdAt"),
    ("updated_at", "updatedAt"),
    ("deleted_at", "deletedAt"),
    ("last_server_seq", "lastServerSeq"),
    ("sync_status", "syncStatus"),
];

/// Value kind of a table-specific column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Uuid,
    Text,
    Int,
    Bool,
    Json,
}

/// One table-specific column: local-db name (camelCase), wire name
/// (snake_case), kind and constraints.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub db_field: &'static str,
    pub dto_field: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub max_len: Option<usize>,
}

const fn field(
    db_field: &'static str,
    dto_field: &'static str,
    kind: FieldKind,
    required: bool,
) -> FieldDef {
    FieldDef {
        db_field,
        dto_field,
        kind,
        required,
        max_len: None,
    }
}

const fn text_field(
    db_field: &'static str,
    dto_field: &'static str,
    required: bool,
    max_len: usize,
) -> FieldDef {
    FieldDef {
        db_field,
        dto_field,
        kind: FieldKind::Text,
        required,
        max_len: Some(max_len),
    }
}

/// Foreign-key style reference checked by the push applier before a row
/// is accepted: `field` (wire name) must name an existing row in `table`.
#[derive(Debug, Clone, Copy)]
pub struct FkRef {
    pub field: &'static str,
    pub table: &'static str,
}

/// One registry entry per sync table.
#[derive(Debug, Clone, Copy)]
pub struct TableEntry {
    /// Canonical sync name (also the SQL table name).
    pub name: &'static str,
    /// Matching name used in ledger transactions.
    pub ledger_name: &'static str,
    /// Table-specific columns in wire order.
    pub fields: &'static [FieldDef],
    /// Columns keying the UPSERT on apply.
    pub conflict_target: &'static [&'static str],
    /// Tables that must be applied before this one.
    pub depends_on: &'static [&'static str],
    /// Referents the push applier verifies exist.
    pub fk_refs: &'static [FkRef],
    /// Rows are filtered by actor on pull (chat privacy).
    pub privacy_scoped: bool,
}

static ENTRIES: &[TableEntry] = &[
    TableEntry {
        name: "entity_types",
        ledger_name: "entity_types",
        fields: &[
            text_field("name", "name", true, 200),
            text_field("description", "description", false, 2000),
            field("sortOrder", "sort_order", FieldKind::Int, false),
        ],
        conflict_target: &["id"],
        depends_on: &[],
        fk_refs: &[],
        privacy_scoped: false,
    },
    TableEntry {
        name: "entities",
        ledger_name: "entities",
        fields: &[
            field("typeId", "type_id", FieldKind::Uuid, true),
            text_field("name", "name", true, 500),
            text_field("status", "status", false, 100),
        ],
        conflict_target: &["id"],
        depends_on: &["entity_types"],
        fk_refs: &[FkRef {
            field: "type_id",
            table: "entity_types",
        }],
        privacy_scoped: false,
    },
    TableEntry {
        name: "attribute_defs",
        ledger_name: "attribute_defs",
        fields: &[
            field("typeId", "type_id", FieldKind::Uuid, true),
            text_field("name", "name", true, 200),
            text_field("dataType", "data_type", true, 50),
            field("sortOrder", "sort_order", FieldKind::Int, false),
        ],
        conflict_target: &["id"],
        depends_on: &["entity_types"],
        fk_refs: &[FkRef {
            field: "type_id",
            table: "entity_types",
        }],
        privacy_scoped: false,
    },
    TableEntry {
        name: "attribute_values",
        ledger_name: "attribute_values",
        fields: &[
            field("entityId", "entity_id", FieldKind::Uuid, true),
            field("attributeDefId", "attribute_def_id", FieldKind::Uuid, true),
            field("value", "value", FieldKind::Json, false),
        ],
        conflict_target: &["id"],
        depends_on: &["entities", "attribute_defs"],
        fk_refs: &[
            FkRef {
                field: "entity_id",
                table: "entities",
            },
            FkRef {
                field: "attribute_def_id",
                table: "attribute_defs",
            },
        ],
        privacy_scoped: false,
    },
    TableEntry {
        name: "operations",
        ledger_name: "operations",
        fields: &[
            field("entityId", "entity_id", FieldKind::Uuid, true),
            text_field("kind", "kind", true, 100),
            field("details", "details", FieldKind::Json, false),
            field("performedBy", "performed_by", FieldKind::Uuid, false),
        ],
        conflict_target: &["id"],
        depends_on: &["entities"],
        fk_refs: &[FkRef {
            field: "entity_id",
            table: "entities",
        }],
        privacy_scoped: false,
    },
    TableEntry {
        name: "audit_log",
        ledger_name: "audit_log",
        fields: &[
            field("actorId", "actor_id", FieldKind::Uuid, false),
            text_field("action", "action", true, 200),
            text_field("targetTable", "target_table", false, 100),
            field("targetId", "target_id", FieldKind::Uuid, false),
            field("details", "details", FieldKind::Json, false),
        ],
        conflict_target: &["id"],
        depends_on: &[],
        fk_refs: &[],
        privacy_scoped: false,
    },
    TableEntry {
        name: "chat_messages",
        ledger_name: "chat_messages",
        fields: &[
            field("senderUserId", "sender_user_id", FieldKind::Uuid, true),
            field("recipientUserId", "recipient_user_id", FieldKind::Uuid, false),
            text_field("body", "body", true, 4000),
        ],
        conflict_target: &["id"],
        depends_on: &[],
        fk_refs: &[],
        privacy_scoped: true,
    },
    TableEntry {
        name: "chat_reads",
        ledger_name: "chat_reads",
        fields: &[
            field("messageId", "message_id", FieldKind::Uuid, true),
            field("userId", "user_id", FieldKind::Uuid, true),
            field("readAt", "read_at", FieldKind::Int, false),
        ],
        conflict_target: &["id"],
        depends_on: &["chat_messages"],
        fk_refs: &[FkRef {
            field: "message_id",
            table: "chat_messages",
        }],
        privacy_scoped: true,
    },
    TableEntry {
        name: "user_presence",
        ledger_name: "user_presence",
        fields: &[
            field("userId", "user_id", FieldKind::Uuid, true),
            text_field("status", "status", false, 100),
            field("lastSeenAt", "last_seen_at", FieldKind::Int, false),
        ],
        conflict_target: &["id"],
        depends_on: &[],
        fk_refs: &[],
        privacy_scoped: false,
    },
    TableEntry {
        name: "notes",
        ledger_name: "notes",
        fields: &[
            field("ownerUserId", "owner_user_id", FieldKind::Uuid, true),
            text_field("title", "title", false, 500),
            text_field("body", "body", false, 100_000),
        ],
        conflict_target: &["id"],
        depends_on: &[],
        fk_refs: &[],
        privacy_scoped: false,
    },
    TableEntry {
        name: "note_shares",
        ledger_name: "note_shares",
        fields: &[
            field("noteId", "note_id", FieldKind::Uuid, true),
            field("userId", "user_id", FieldKind::Uuid, true),
            field("canEdit", "can_edit", FieldKind::Bool, false),
        ],
        conflict_target: &["id"],
        depends_on: &["notes"],
        fk_refs: &[FkRef {
            field: "note_id",
            table: "notes",
        }],
        privacy_scoped: false,
    },
];

/// A validation failure naming the offending field.
#[derive(Debug, Clone)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// The process-wide table registry.
pub struct TableRegistry {
    entries: &'static [TableEntry],
}

static REGISTRY: OnceLock<TableRegistry> = OnceLock::new();

impl TableRegistry {
    /// Global registry instance. Dependency order is verified on first
    /// access; a violation is a programming error and panics at startup.
    pub fn global() -> &'static TableRegistry {
        REGISTRY.get_or_init(|| {
            let registry = TableRegistry { entries: ENTRIES };
            registry
                .verify_dependency_order()
                .expect("table registry dependency order invalid");
            registry
        })
    }

    /// All entries, parents strictly before dependents.
    pub fn entries(&self) -> &'static [TableEntry] {
        self.entries
    }

    pub fn get(&self, name: &str) -> Option<&'static TableEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_sync_table(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Verify every `depends_on` and `fk_refs` target is registered and
    /// appears strictly before its dependent (implies acyclicity).
    fn verify_dependency_order(&self) -> Result<(), String> {
        let mut seen: HashSet<&str> = HashSet::new();
        for entry in self.entries {
            for dep in entry.depends_on {
                if !seen.contains(dep) {
                    return Err(format!(
                        "table {} depends on {} which is not registered earlier",
                        entry.name, dep
                    ));
                }
            }
            for fk in entry.fk_refs {
                if !seen.contains(fk.table) && fk.table != entry.name {
                    return Err(format!(
                        "table {} references {} which is not registered earlier",
                        entry.name, fk.table
                    ));
                }
            }
            // UPSERTs key on the conflict target, which must name a
            // uniquely indexed column. Only the primary key qualifies.
            if entry.conflict_target != ["id"].as_slice() {
                return Err(format!(
                    "table {} conflict target is not uniquely indexed",
                    entry.name
                ));
            }
            seen.insert(entry.name);
        }
        Ok(())
    }

    /// Convert a local-db row (camelCase) to wire form (snake_case).
    /// Unknown fields are dropped.
    pub fn to_sync_row(&self, name: &str, db_row: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        let Some(entry) = self.get(name) else {
            return out;
        };
        for (wire, local) in ENVELOPE_FIELDS {
            if let Some(v) = db_row.get(*local) {
                out.insert((*wire).to_string(), v.clone());
            }
        }
        for f in entry.fields {
            if let Some(v) = db_row.get(f.db_field) {
                out.insert(f.dto_field.to_string(), v.clone());
            }
        }
        out
    }

    /// Convert a wire row (snake_case) to local-db form (camelCase).
    /// Unknown fields are dropped.
    pub fn to_db_row(&self, name: &str, dto_row: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::new();
        let Some(entry) = self.get(name) else {
            return out;
        };
        for (wire, local) in ENVELOPE_FIELDS {
            if let Some(v) = dto_row.get(*wire) {
                out.insert((*local).to_string(), v.clone());
            }
        }
        for f in entry.fields {
            if let Some(v) = dto_row.get(f.dto_field) {
                out.insert(f.db_field.to_string(), v.clone());
            }
        }
        out
    }

    /// Validate a wire row against its table schema.
    pub fn validate(&self, name: &str, row: &Map<String, Value>) -> bool {
        self.check(name, row).is_ok()
    }

    /// Validate a wire row, returning the first offending field on failure.
    pub fn check(&self, name: &str, row: &Map<String, Value>) -> Result<(), FieldIssue> {
        let entry = self
            .get(name)
            .ok_or_else(|| FieldIssue::new("table", format!("unknown sync table {name}")))?;

        // Envelope: identity and timestamps.
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| FieldIssue::new("id", "missing or non-string id"))?;
        if Uuid::parse_str(id).is_err() {
            return Err(FieldIssue::new("id", "id is not a UUID"));
        }
        let created_at = require_epoch(row, "created_at")?;
        let updated_at = require_epoch(row, "updated_at")?;
        if updated_at < created_at {
            return Err(FieldIssue::new("updated_at", "updated_at < created_at"));
        }
        let deleted_at = optional_epoch(row, "deleted_at")?;
        if let Some(deleted_at) = deleted_at {
            if deleted_at < updated_at {
                return Err(FieldIssue::new("deleted_at", "deleted_at < updated_at"));
            }
        }
        if let Some(seq) = row.get("last_server_seq") {
            if !seq.is_null() && seq.as_i64().map_or(true, |n| n < 0) {
                return Err(FieldIssue::new(
                    "last_server_seq",
                    "last_server_seq must be a non-negative integer",
                ));
            }
        }
        if let Some(status) = row.get("sync_status") {
            if !status.is_null() {
                match status.as_str() {
                    Some("synced") | Some("pending") | Some("error") => {}
                    _ => {
                        return Err(FieldIssue::new(
                            "sync_status",
                            "sync_status must be synced, pending or error",
                        ))
                    }
                }
            }
        }

        // Table-specific columns. Required fields are enforced on live rows
        // only; tombstones may arrive stripped of payload.
        let tombstone = deleted_at.is_some();
        for f in entry.fields {
            match row.get(f.dto_field) {
                None | Some(Value::Null) => {
                    if f.required && !tombstone {
                        return Err(FieldIssue::new(f.dto_field, "required field missing"));
                    }
                }
                Some(v) => check_kind(f, v)?,
            }
        }
        Ok(())
    }
}

fn require_epoch(row: &Map<String, Value>, field: &str) -> Result<i64, FieldIssue> {
    match row.get(field).and_then(Value::as_i64) {
        Some(n) if n >= 0 => Ok(n),
        _ => Err(FieldIssue::new(
            field,
            "must be a non-negative epoch-ms integer",
        )),
    }
}

fn optional_epoch(row: &Map<String, Value>, field: &str) -> Result<Option<i64>, FieldIssue> {
    match row.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Ok(Some(n)),
            _ => Err(FieldIssue::new(
                field,
                "must be null or a non-negative epoch-ms integer",
            )),
        },
    }
}

fn check_kind(f: &FieldDef, v: &Value) -> Result<(), FieldIssue> {
    match f.kind {
        FieldKind::Uuid => {
            let s = v
                .as_str()
                .ok_or_else(|| FieldIssue::new(f.dto_field, "expected UUID string"))?;
            if Uuid::parse_str(s).is_err() {
                return Err(FieldIssue::new(f.dto_field, "not a valid UUID"));
            }
        }
        FieldKind::Text => {
            let s = v
                .as_str()
                .ok_or_else(|| FieldIssue::new(f.dto_field, "expected string"))?;
            if let Some(max) = f.max_len {
                if s.chars().count() > max {
                    return Err(FieldIssue::new(
                        f.dto_field,
                        format!("exceeds maximum length {max}"),
                    ));
                }
            }
        }
        FieldKind::Int => {
            if v.as_i64().is_none() {
                return Err(FieldIssue::new(f.dto_field, "expected integer"));
            }
        }
        FieldKind::Bool => {
            if !v.is_boolean() {
                return Err(FieldIssue::new(f.dto_field, "expected boolean"));
            }
        }
        FieldKind::Json => {}
    }
    Ok(())
}
