//! schema reads the master schema table rooted at page 1 and parses the
//! stored CREATE statements into column definitions.
//!
//! Page 1 is always a table b-tree page, the root of the schema table:
//! `CREATE TABLE sqlite_master (type text, name text, tbl_name text,
//! rootpage integer, sql text)`.

use pest::Parser;

use crate::btree::table as btree_table;
use crate::btree::PageSource;
use crate::database::PageNum;
use crate::dbheader::TextEncoding;
use crate::record::Record;
use crate::serial_type::Value;

pub const SCHEMA_TABLE_NAME: &str = "sqlite_master";
pub const SCHEMA_BTREE_ROOT_PAGENUM: PageNum = 1;
const SCHEMA_TABLE_TYPE_COLIDX: usize = 0;
const SCHEMA_TABLE_NAME_COLIDX: usize = 1;
const SCHEMA_TABLE_TBL_NAME_COLIDX: usize = 2;
const SCHEMA_TABLE_ROOTPAGE_COLIDX: usize = 3;
const SCHEMA_TABLE_SQL_COLIDX: usize = 4;

#[derive(pest_derive::Parser)]
#[grammar = "sql.pest"]
struct SqlParser;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error walking the master schema b-tree: {0}")]
    BTree(#[from] crate::btree::Error),
    #[error("Error decoding master schema record: {0}")]
    Record(#[from] crate::record::Error),
    #[error("Master schema row has {got} columns, expected 5.")]
    RowShape { got: usize },
    #[error("Master schema row column {column} has storage class {found}, expected {expected}.")]
    RowColumnType {
        column: &'static str,
        found: &'static str,
        expected: &'static str,
    },
    #[error("Master schema row type {0:?} is not table, index, view or trigger.")]
    UnknownRowType(String),
    #[error("Failed to parse CREATE statement for {name:?}: {message}")]
    CreateStatementParsing { name: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterSchemaRowType {
    Table,
    Index,
    View,
    Trigger,
}

impl std::fmt::Display for MasterSchemaRowType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MasterSchemaRowType::Table => write!(f, "table"),
            MasterSchemaRowType::Index => write!(f, "index"),
            MasterSchemaRowType::View => write!(f, "view"),
            MasterSchemaRowType::Trigger => write!(f, "trigger"),
        }
    }
}

/// Column type affinity per https://www.sqlite.org/datatype3.html#affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeAffinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl TypeAffinity {
    /// The affinity determination rules, applied in their documented order.
    pub fn from_declared_type(declared: &str) -> TypeAffinity {
        let upper = declared.to_uppercase();
        if upper.contains("INT") {
            TypeAffinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            TypeAffinity::Text
        } else if upper.contains("BLOB") || upper.is_empty() {
            TypeAffinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            TypeAffinity::Real
        } else {
            TypeAffinity::Numeric
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub index: usize,
    pub name: String,
    pub declared_type: String,
    pub type_affinity: TypeAffinity,
    /// Constraint clauses as written, e.g. "PRIMARY KEY" or "NOT NULL".
    pub constraints: Vec<String>,
    pub default: Option<String>,
}

impl ColumnDefinition {
    pub fn is_primary_key(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| c.to_uppercase().starts_with("PRIMARY KEY"))
    }

    /// An INTEGER PRIMARY KEY column aliases the rowid and stores NULL in
    /// the record body.
    pub fn is_rowid_alias(&self) -> bool {
        self.type_affinity == TypeAffinity::Integer && self.is_primary_key()
    }
}

/// One row of the master schema.
#[derive(Debug, Clone)]
pub struct MasterSchemaEntry {
    pub row_type: MasterSchemaRowType,
    pub name: String,
    pub table_name: String,
    pub root_page: PageNum,
    pub sql: Option<String>,
    pub column_definitions: Vec<ColumnDefinition>,
    /// Objects whose name starts with "sqlite_" belong to SQLite itself.
    pub internal_schema_object: bool,
    pub without_row_id: bool,
    /// CREATE VIRTUAL TABLE entries; their shadow storage is carved through
    /// the shadow tables, never through the virtual table itself.
    pub virtual_table: bool,
}

impl MasterSchemaEntry {
    pub fn number_of_columns(&self) -> usize {
        self.column_definitions.len()
    }

    /// Tables that can be walked and carved: ordinary rowid tables with a
    /// real root page.
    pub fn carvable_table(&self) -> bool {
        self.row_type == MasterSchemaRowType::Table
            && self.root_page != 0
            && !self.without_row_id
            && !self.virtual_table
    }
}

/// The parsed master schema of one version of the database.
#[derive(Debug, Clone, Default)]
pub struct MasterSchema {
    pub entries: Vec<MasterSchemaEntry>,
}

impl MasterSchema {
    /// Read the schema table from page 1 of `source`.
    ///
    /// In lenient mode, rows that fail to parse are logged and skipped.
    pub fn parse<S: PageSource>(
        source: &S,
        text_encoding: TextEncoding,
        strict: bool,
    ) -> Result<MasterSchema, Error> {
        let walk = btree_table::walk(source, SCHEMA_BTREE_ROOT_PAGENUM, strict)?;
        let mut entries = Vec::new();
        for cell in &walk.cells {
            match parse_master_schema_row(&cell.payload, text_encoding) {
                Ok(entry) => entries.push(entry),
                Err(e) if strict => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        component = "schema",
                        page = cell.page_number,
                        offset = cell.cell_start_offset,
                        error = %e,
                        "failed to parse master schema row, skipping"
                    );
                }
            }
        }
        Ok(MasterSchema { entries })
    }

    pub fn tables(&self) -> impl Iterator<Item = &MasterSchemaEntry> {
        self.entries
            .iter()
            .filter(|e| e.row_type == MasterSchemaRowType::Table)
    }

    pub fn entry(&self, name: &str) -> Option<&MasterSchemaEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Root pages of every table and index in the schema.
    pub fn root_pages(&self) -> Vec<PageNum> {
        self.entries.iter().filter(|e| e.root_page != 0).map(|e| e.root_page).collect()
    }
}

fn parse_master_schema_row(
    payload: &[u8],
    text_encoding: TextEncoding,
) -> Result<MasterSchemaEntry, Error> {
    let record = Record::parse(payload)?;
    if record.columns.len() != 5 {
        return Err(Error::RowShape { got: record.columns.len() });
    }
    let text_of = |idx: usize, column: &'static str| -> Result<String, Error> {
        match &record.columns[idx].value {
            Value::Text(bytes) => Ok(text_encoding.decode_lossy(bytes)),
            other => Err(Error::RowColumnType {
                column,
                found: storage_class_name(other),
                expected: "text",
            }),
        }
    };

    let row_type_text = text_of(SCHEMA_TABLE_TYPE_COLIDX, "type")?;
    let row_type = match row_type_text.as_str() {
        "table" => MasterSchemaRowType::Table,
        "index" => MasterSchemaRowType::Index,
        "view" => MasterSchemaRowType::View,
        "trigger" => MasterSchemaRowType::Trigger,
        _ => return Err(Error::UnknownRowType(row_type_text)),
    };
    let name = text_of(SCHEMA_TABLE_NAME_COLIDX, "name")?;
    let table_name = text_of(SCHEMA_TABLE_TBL_NAME_COLIDX, "tbl_name")?;
    let root_page = match &record.columns[SCHEMA_TABLE_ROOTPAGE_COLIDX].value {
        Value::Int(i) => *i as PageNum,
        // Views and triggers store NULL here.
        Value::Null => 0,
        other => {
            return Err(Error::RowColumnType {
                column: "rootpage",
                found: storage_class_name(other),
                expected: "integer",
            })
        }
    };
    let sql = match &record.columns[SCHEMA_TABLE_SQL_COLIDX].value {
        Value::Text(bytes) => Some(text_encoding.decode_lossy(bytes)),
        // Internal indexes (sqlite_autoindex_*) store NULL sql.
        Value::Null => None,
        other => {
            return Err(Error::RowColumnType {
                column: "sql",
                found: storage_class_name(other),
                expected: "text",
            })
        }
    };

    let internal_schema_object = name.starts_with("sqlite_");
    let mut column_definitions = Vec::new();
    let mut without_row_id = false;
    let mut virtual_table = false;
    if row_type == MasterSchemaRowType::Table {
        if let Some(sql_text) = &sql {
            if is_create_virtual_table(sql_text) {
                virtual_table = true;
            } else {
                let parsed = parse_create_table_statement(sql_text).map_err(|message| {
                    Error::CreateStatementParsing { name: name.clone(), message }
                })?;
                column_definitions = parsed.columns;
                without_row_id = parsed.without_row_id;
            }
        }
    }

    Ok(MasterSchemaEntry {
        row_type,
        name,
        table_name,
        root_page,
        sql,
        column_definitions,
        internal_schema_object,
        without_row_id,
        virtual_table,
    })
}

fn storage_class_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Int(_) => "integer",
        Value::Real(_) => "real",
        Value::Blob(_) => "blob",
        Value::Text(_) => "text",
    }
}

fn is_create_virtual_table(sql: &str) -> bool {
    let mut words = sql.split_whitespace();
    matches!(
        (words.next(), words.next()),
        (Some(w1), Some(w2))
            if w1.eq_ignore_ascii_case("create") && w2.eq_ignore_ascii_case("virtual")
    )
}

#[derive(Debug)]
pub struct ParsedCreateTable {
    pub table_name: String,
    pub columns: Vec<ColumnDefinition>,
    pub without_row_id: bool,
}

/// Parse a CREATE TABLE statement into column definitions.
pub fn parse_create_table_statement(sql: &str) -> Result<ParsedCreateTable, String> {
    let mut pairs =
        SqlParser::parse(Rule::create_table_stmt, sql).map_err(|e| e.to_string())?;
    let stmt = pairs.next().ok_or_else(|| "empty parse result".to_string())?;

    let mut table_name = String::new();
    let mut columns: Vec<ColumnDefinition> = Vec::new();
    let mut without_row_id = false;
    for node in stmt.into_inner() {
        match node.as_rule() {
            Rule::table_identifier_with_optional_db => {
                let parts: Vec<_> = node.into_inner().collect();
                // With a database qualifier the table name is the last part.
                if let Some(last) = parts.last() {
                    table_name = unquote_identifier(last.as_str());
                }
            }
            Rule::column_def => {
                let mut inner = node.into_inner();
                let name = unquote_identifier(
                    inner.next().ok_or_else(|| "column without a name".to_string())?.as_str(),
                );
                let mut declared_type = String::new();
                let mut constraints = Vec::new();
                let mut default = None;
                for part in inner {
                    match part.as_rule() {
                        Rule::type_name => declared_type = normalize_spacing(part.as_str()),
                        Rule::column_constraint => {
                            let text = normalize_spacing(part.as_str());
                            if let Some(d) = part
                                .into_inner()
                                .find(|p| p.as_rule() == Rule::default_cc)
                                .and_then(|p| {
                                    p.into_inner().find(|q| q.as_rule() == Rule::default_value)
                                })
                            {
                                default = Some(d.as_str().trim().to_string());
                            }
                            constraints.push(text);
                        }
                        _ => {}
                    }
                }
                columns.push(ColumnDefinition {
                    index: columns.len(),
                    type_affinity: TypeAffinity::from_declared_type(&declared_type),
                    name,
                    declared_type,
                    constraints,
                    default,
                });
            }
            Rule::table_options => {
                without_row_id = node
                    .into_inner()
                    .any(|o| o.into_inner().any(|p| p.as_rule() == Rule::without_rowid));
            }
            _ => {}
        }
    }
    Ok(ParsedCreateTable { table_name, columns, without_row_id })
}

/// Strip the quoting flavor from an identifier and undouble its escapes.
fn unquote_identifier(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        match (bytes[0], bytes[bytes.len() - 1]) {
            (b'"', b'"') => return raw[1..raw.len() - 1].replace("\"\"", "\""),
            (b'`', b'`') => return raw[1..raw.len() - 1].replace("``", "`"),
            (b'\'', b'\'') => return raw[1..raw.len() - 1].replace("''", "'"),
            (b'[', b']') => return raw[1..raw.len() - 1].to_string(),
            _ => {}
        }
    }
    raw.to_string()
}

/// Collapse runs of whitespace so stored clauses read uniformly.
fn normalize_spacing(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_create_table() {
        let parsed =
            parse_create_table_statement("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
                .unwrap();
        assert_eq!(parsed.table_name, "t");
        assert_eq!(parsed.columns.len(), 3);
        assert_eq!(parsed.columns[0].name, "id");
        assert_eq!(parsed.columns[0].type_affinity, TypeAffinity::Integer);
        assert!(parsed.columns[0].is_primary_key());
        assert!(parsed.columns[0].is_rowid_alias());
        assert_eq!(parsed.columns[1].name, "name");
        assert_eq!(parsed.columns[1].type_affinity, TypeAffinity::Text);
        assert_eq!(parsed.columns[2].name, "age");
        assert!(!parsed.without_row_id);
    }

    #[test]
    fn test_parse_quoting_flavors() {
        let parsed = parse_create_table_statement(
            "CREATE TABLE \"my table\" (`first col` int, [second col] text, \"odd\"\"name\" blob)",
        )
        .unwrap();
        assert_eq!(parsed.table_name, "my table");
        assert_eq!(parsed.columns[0].name, "first col");
        assert_eq!(parsed.columns[1].name, "second col");
        assert_eq!(parsed.columns[2].name, "odd\"name");
    }

    #[test]
    fn test_parse_comments_in_create() {
        let sql = "CREATE TABLE t ( -- the key\n a int, /* the /* nested */ value */ b text )";
        let parsed = parse_create_table_statement(sql).unwrap();
        assert_eq!(parsed.columns.len(), 2);
        assert_eq!(parsed.columns[0].name, "a");
        assert_eq!(parsed.columns[1].name, "b");
    }

    #[test]
    fn test_bare_dash_is_not_a_comment() {
        // "-" alone must fail the parse rather than swallow the rest.
        assert!(parse_create_table_statement("CREATE TABLE t (a int - 1)").is_err());
    }

    #[test]
    fn test_unterminated_string_fails() {
        assert!(parse_create_table_statement("CREATE TABLE t (a int DEFAULT 'oops)").is_err());
        assert!(parse_create_table_statement("CREATE TABLE t (a int /* oops )").is_err());
    }

    #[test]
    fn test_parse_defaults_and_constraints() {
        let parsed = parse_create_table_statement(
            "CREATE TABLE t (a INT NOT NULL DEFAULT 7, b TEXT DEFAULT 'x,y', c REAL DEFAULT (1+2))",
        )
        .unwrap();
        assert_eq!(parsed.columns[0].default.as_deref(), Some("7"));
        assert!(parsed.columns[0].constraints.iter().any(|c| c == "NOT NULL"));
        assert_eq!(parsed.columns[1].default.as_deref(), Some("'x,y'"));
        assert_eq!(parsed.columns[2].default.as_deref(), Some("(1+2)"));
    }

    #[test]
    fn test_parse_table_constraints_not_columns() {
        let parsed = parse_create_table_statement(
            "CREATE TABLE t (a int, b int, PRIMARY KEY (a, b), UNIQUE (b), FOREIGN KEY (a) REFERENCES other (x) ON DELETE CASCADE)",
        )
        .unwrap();
        assert_eq!(parsed.columns.len(), 2);
    }

    #[test]
    fn test_parse_without_rowid() {
        let parsed =
            parse_create_table_statement("CREATE TABLE t (k TEXT PRIMARY KEY, v TEXT) WITHOUT ROWID")
                .unwrap();
        assert!(parsed.without_row_id);
    }

    #[test]
    fn test_parse_multi_word_types() {
        let parsed = parse_create_table_statement(
            "CREATE TABLE t (a UNSIGNED BIG INT, b VARYING CHARACTER(70), c DOUBLE PRECISION)",
        )
        .unwrap();
        assert_eq!(parsed.columns[0].declared_type, "UNSIGNED BIG INT");
        assert_eq!(parsed.columns[0].type_affinity, TypeAffinity::Integer);
        assert_eq!(parsed.columns[1].declared_type, "VARYING CHARACTER(70)");
        assert_eq!(parsed.columns[1].type_affinity, TypeAffinity::Text);
        assert_eq!(parsed.columns[2].type_affinity, TypeAffinity::Real);
    }

    #[test]
    fn test_affinity_rules() {
        let cases = vec![
            ("INT", TypeAffinity::Integer),
            ("INTEGER", TypeAffinity::Integer),
            ("TINYINT", TypeAffinity::Integer),
            ("CHARACTER(20)", TypeAffinity::Text),
            ("VARCHAR(255)", TypeAffinity::Text),
            ("CLOB", TypeAffinity::Text),
            ("TEXT", TypeAffinity::Text),
            ("BLOB", TypeAffinity::Blob),
            ("", TypeAffinity::Blob),
            ("REAL", TypeAffinity::Real),
            ("DOUBLE", TypeAffinity::Real),
            ("FLOAT", TypeAffinity::Real),
            ("NUMERIC", TypeAffinity::Numeric),
            ("DECIMAL(10,5)", TypeAffinity::Numeric),
            ("BOOLEAN", TypeAffinity::Numeric),
            ("DATE", TypeAffinity::Numeric),
        ];
        for (declared, expected) in cases {
            assert_eq!(TypeAffinity::from_declared_type(declared), expected, "type {}", declared);
        }
    }

    #[test]
    fn test_virtual_table_detection() {
        assert!(is_create_virtual_table("CREATE VIRTUAL TABLE ft USING fts5(content)"));
        assert!(!is_create_virtual_table("CREATE TABLE t (a int)"));
    }

    #[test]
    fn test_parse_master_schema_row_for_table() {
        // Build the sqlite_master record for a small table by hand.
        let sql = "CREATE TABLE t (a int, b text)";
        let record = build_master_record("table", "t", "t", 2, Some(sql));
        let entry = parse_master_schema_row(&record, TextEncoding::Utf8).unwrap();
        assert_eq!(entry.row_type, MasterSchemaRowType::Table);
        assert_eq!(entry.name, "t");
        assert_eq!(entry.root_page, 2);
        assert_eq!(entry.column_definitions.len(), 2);
        assert!(entry.carvable_table());
        assert!(!entry.internal_schema_object);
    }

    #[test]
    fn test_parse_master_schema_row_rejects_bad_shape() {
        // A record with only 2 columns.
        let payload = vec![0x03, 0x01, 0x01, 0x07, 0x08];
        assert!(matches!(
            parse_master_schema_row(&payload, TextEncoding::Utf8),
            Err(Error::RowShape { got: 2 })
        ));
    }

    /// Encode a 5-column sqlite_master record.
    pub(crate) fn build_master_record(
        row_type: &str,
        name: &str,
        tbl_name: &str,
        root_page: i64,
        sql: Option<&str>,
    ) -> Vec<u8> {
        let mut serial_types: Vec<i64> = Vec::new();
        let mut body: Vec<u8> = Vec::new();
        for text in [row_type, name, tbl_name] {
            serial_types.push(13 + 2 * text.len() as i64);
            body.extend_from_slice(text.as_bytes());
        }
        serial_types.push(1);
        body.push(root_page as u8);
        match sql {
            Some(s) => {
                serial_types.push(13 + 2 * s.len() as i64);
                body.extend_from_slice(s.as_bytes());
            }
            None => serial_types.push(0),
        }
        let mut header: Vec<u8> = Vec::new();
        for st in &serial_types {
            header.extend(crate::varint::encode(*st));
        }
        let header_size = header.len() + 1;
        assert!(header_size < 128);
        let mut record = vec![header_size as u8];
        record.extend(header);
        record.extend(body);
        record
    }
}
