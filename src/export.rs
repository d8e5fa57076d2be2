//! export defines the sink interface commits are handed to, plus the text
//! and CSV sinks. Value rendering lives here: the core yields TEXT as raw
//! bytes in the database encoding, and transcoding them is sink business.

use std::io::Write;

use crate::carve::CarvedCell;
use crate::commit::{Commit, CommitCell};
use crate::dbheader::TextEncoding;
use crate::schema::MasterSchemaEntry;
use crate::serial_type::OwnedValue;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error writing export output: {0}")]
    Io(#[from] std::io::Error),
}

/// What a sink needs to know about the commits it receives, beyond the
/// commits themselves.
pub struct ExportContext<'a> {
    pub text_encoding: TextEncoding,
    pub entry: &'a MasterSchemaEntry,
}

/// Receives commits in ascending (table, version) order.
pub trait CommitSink {
    fn write_commit(&mut self, context: &ExportContext, commit: &Commit) -> Result<(), Error>;

    /// Called once after the last commit. Sinks holding buffers flush here.
    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Render one value for human- or CSV-facing output.
pub fn render_value(value: &OwnedValue, encoding: TextEncoding) -> String {
    match value {
        OwnedValue::Null => "NULL".to_string(),
        OwnedValue::Int(i) => i.to_string(),
        OwnedValue::Real(f) => f.to_string(),
        OwnedValue::Text(bytes) => encoding.decode_lossy(bytes),
        OwnedValue::Blob(bytes) => format!("x'{}'", hex::encode(bytes)),
    }
}

/// Human-readable dump, one block per commit.
pub struct TextExporter<W: Write> {
    out: W,
}

impl<W: Write> TextExporter<W> {
    pub fn new(out: W) -> TextExporter<W> {
        TextExporter { out }
    }

    fn write_cells(
        &mut self,
        label: &str,
        cells: &[CommitCell],
        encoding: TextEncoding,
    ) -> Result<(), Error> {
        for cell in cells {
            let values: Vec<String> =
                cell.values.iter().map(|v| render_value(v, encoding)).collect();
            writeln!(
                self.out,
                "  {:<8} rowid={:<8} page={:<6} ({})",
                label,
                cell.row_id.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string()),
                cell.page_number,
                values.join(", ")
            )?;
        }
        Ok(())
    }

    fn write_carved(&mut self, cells: &[CarvedCell], encoding: TextEncoding) -> Result<(), Error> {
        for cell in cells {
            let values: Vec<String> =
                cell.values.iter().map(|v| render_value(v, encoding)).collect();
            let mut flags = Vec::new();
            if cell.truncated_beginning {
                flags.push("truncated-beginning");
            }
            if cell.truncated_ending {
                flags.push("truncated-ending");
            }
            if cell.probabilistic_first_serial_type {
                flags.push("probabilistic-first-type");
            }
            writeln!(
                self.out,
                "  carved   {:<8} page={:<6} offset={:<6} [{}] ({})",
                cell.location,
                cell.page_number,
                cell.cell_start_offset,
                flags.join(","),
                values.join(", ")
            )?;
        }
        Ok(())
    }
}

impl<W: Write> CommitSink for TextExporter<W> {
    fn write_commit(&mut self, context: &ExportContext, commit: &Commit) -> Result<(), Error> {
        if !commit.updated {
            return Ok(());
        }
        writeln!(
            self.out,
            "{} version {} ({}, root page {}):",
            commit.name, commit.version_number, commit.file_type, commit.root_page_number
        )?;
        let encoding = context.text_encoding;
        self.write_cells("added", &commit.added_cells, encoding)?;
        self.write_cells("updated", &commit.updated_cells, encoding)?;
        self.write_cells("deleted", &commit.deleted_cells, encoding)?;
        self.write_carved(&commit.carved_cells, encoding)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.out.flush()?;
        Ok(())
    }
}

/// One CSV row per cell, with commit metadata in the leading columns.
pub struct CsvExporter<W: Write> {
    out: W,
    header_written: bool,
}

impl<W: Write> CsvExporter<W> {
    pub fn new(out: W) -> CsvExporter<W> {
        CsvExporter { out, header_written: false }
    }

    fn write_row(&mut self, fields: &[String]) -> Result<(), Error> {
        let escaped: Vec<String> = fields.iter().map(|f| escape_csv_field(f)).collect();
        writeln!(self.out, "{}", escaped.join(","))?;
        Ok(())
    }

    fn write_header(&mut self, context: &ExportContext) -> Result<(), Error> {
        if self.header_written {
            return Ok(());
        }
        self.header_written = true;
        let mut fields: Vec<String> = ["table", "version", "file_type", "operation", "rowid", "flags"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for column in &context.entry.column_definitions {
            fields.push(column.name.clone());
        }
        self.write_row(&fields)
    }

    fn cell_row(
        &mut self,
        context: &ExportContext,
        commit: &Commit,
        operation: &str,
        row_id: Option<i64>,
        flags: &str,
        values: &[OwnedValue],
    ) -> Result<(), Error> {
        let mut fields = vec![
            commit.name.clone(),
            commit.version_number.to_string(),
            commit.file_type.to_string(),
            operation.to_string(),
            row_id.map(|r| r.to_string()).unwrap_or_default(),
            flags.to_string(),
        ];
        let column_count = context.entry.column_definitions.len().max(values.len());
        for i in 0..column_count {
            fields.push(
                values
                    .get(i)
                    .map(|v| render_value(v, context.text_encoding))
                    .unwrap_or_default(),
            );
        }
        self.write_row(&fields)
    }
}

impl<W: Write> CommitSink for CsvExporter<W> {
    fn write_commit(&mut self, context: &ExportContext, commit: &Commit) -> Result<(), Error> {
        if !commit.updated {
            return Ok(());
        }
        self.write_header(context)?;
        for (operation, cells) in [
            ("added", &commit.added_cells),
            ("updated", &commit.updated_cells),
            ("deleted", &commit.deleted_cells),
        ] {
            for cell in cells.iter() {
                self.cell_row(context, commit, operation, cell.row_id, "", &cell.values)?;
            }
        }
        for cell in &commit.carved_cells {
            let mut flags = Vec::new();
            if cell.truncated_beginning {
                flags.push("truncated_beginning");
            }
            if cell.truncated_ending {
                flags.push("truncated_ending");
            }
            if cell.probabilistic_first_serial_type {
                flags.push("probabilistic_first_serial_type");
            }
            self.cell_row(context, commit, "carved", cell.row_id, &flags.join(" "), &cell.values)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.out.flush()?;
        Ok(())
    }
}

fn escape_csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BTreePageType;
    use crate::commit::CommitFileType;
    use crate::schema::{parse_create_table_statement, MasterSchemaRowType};

    fn entry() -> MasterSchemaEntry {
        let parsed =
            parse_create_table_statement("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
                .unwrap();
        MasterSchemaEntry {
            row_type: MasterSchemaRowType::Table,
            name: "t".to_string(),
            table_name: "t".to_string(),
            root_page: 2,
            sql: None,
            column_definitions: parsed.columns,
            internal_schema_object: false,
            without_row_id: false,
            virtual_table: false,
        }
    }

    fn sample_commit() -> Commit {
        Commit {
            name: "t".to_string(),
            file_type: CommitFileType::Database,
            version_number: 0,
            page_type: BTreePageType::TableLeaf,
            root_page_number: 2,
            b_tree_page_numbers: vec![2],
            added_cells: vec![CommitCell {
                page_number: 2,
                cell_start_offset: 490,
                row_id: Some(1),
                payload_md5: [0; 16],
                serial_types: vec![0, 19, 1],
                values: vec![
                    OwnedValue::Null,
                    OwnedValue::Text(b"ada, the \"first\"".to_vec()),
                    OwnedValue::Int(36),
                ],
            }],
            updated_cells: Vec::new(),
            deleted_cells: Vec::new(),
            carved_cells: Vec::new(),
            updated: true,
        }
    }

    #[test]
    fn test_render_values() {
        assert_eq!(render_value(&OwnedValue::Null, TextEncoding::Utf8), "NULL");
        assert_eq!(render_value(&OwnedValue::Int(-7), TextEncoding::Utf8), "-7");
        assert_eq!(render_value(&OwnedValue::Real(1.5), TextEncoding::Utf8), "1.5");
        assert_eq!(
            render_value(&OwnedValue::Text(b"hi".to_vec()), TextEncoding::Utf8),
            "hi"
        );
        assert_eq!(
            render_value(&OwnedValue::Blob(vec![0xde, 0xad]), TextEncoding::Utf8),
            "x'dead'"
        );
    }

    #[test]
    fn test_render_utf16le_text() {
        let bytes = vec![b'h', 0, b'i', 0];
        assert_eq!(
            render_value(&OwnedValue::Text(bytes), TextEncoding::Utf16Le),
            "hi"
        );
    }

    #[test]
    fn test_text_exporter_output() {
        let mut buf = Vec::new();
        {
            let mut sink = TextExporter::new(&mut buf);
            let entry = entry();
            let context = ExportContext { text_encoding: TextEncoding::Utf8, entry: &entry };
            sink.write_commit(&context, &sample_commit()).unwrap();
            sink.finish().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("t version 0"));
        assert!(text.contains("added"));
        assert!(text.contains("ada, the \"first\""));
    }

    #[test]
    fn test_csv_exporter_escapes_fields() {
        let mut buf = Vec::new();
        {
            let mut sink = CsvExporter::new(&mut buf);
            let entry = entry();
            let context = ExportContext { text_encoding: TextEncoding::Utf8, entry: &entry };
            sink.write_commit(&context, &sample_commit()).unwrap();
            sink.finish().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "table,version,file_type,operation,rowid,flags,id,name,age");
        let row = lines.next().unwrap();
        assert!(row.starts_with("t,0,database,added,1,,"));
        assert!(row.contains("\"ada, the \"\"first\"\"\""));
    }

    #[test]
    fn test_empty_commit_writes_nothing() {
        let mut commit = sample_commit();
        commit.added_cells.clear();
        commit.updated = false;
        let mut buf = Vec::new();
        {
            let mut sink = TextExporter::new(&mut buf);
            let entry = entry();
            let context = ExportContext { text_encoding: TextEncoding::Utf8, entry: &entry };
            sink.write_commit(&context, &commit).unwrap();
        }
        assert!(buf.is_empty());
    }
}
