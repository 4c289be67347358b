//! SQLite schema definitions

/// Collection table template; `{table}` is replaced by the quoted collection name
pub const CREATE_COLLECTION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc TEXT NOT NULL CHECK (json_valid(doc))
)
"#;

/// Index catalog per database file; TTL rows carry the expiry field and delay
pub const CREATE_INDEXES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS _indexes (
    collection TEXT NOT NULL,
    name TEXT NOT NULL,
    definition TEXT NOT NULL,
    expire_field TEXT,
    expire_after_secs INTEGER,
    PRIMARY KEY (collection, name)
)
"#;

/// Key-value table; a NULL `expires_at` never expires
pub const CREATE_KV_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
)
"#;

pub const CREATE_KV_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at)",
];

/// Schema statements for a document database file
pub fn document_schema_statements() -> Vec<&'static str> {
    vec![CREATE_INDEXES_TABLE]
}

/// Schema statements for a key-value store file
pub fn kv_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![CREATE_KV_TABLE];
    stmts.extend(CREATE_KV_INDEXES.iter().copied());
    stmts
}

/// Quote an identifier for interpolation into SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Physical SQLite index name; SQLite index names are database-wide
pub fn physical_index_name(collection: &str, index: &str) -> String {
    format!("{}${}", collection, index)
}
