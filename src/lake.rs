//! Partitioned Parquet store for raw extracted entities.
//!
//! Layout: `<root>/<entity>/data.parquet` for unpartitioned entities and
//! `<root>/<entity>/<col>=<value>/.../part-0.parquet` for partitioned ones.
//! Replacements go through a hidden sibling directory that is renamed into
//! place, so readers never see a half-written partition.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use parquet::basic::{Compression, LogicalType, Repetition, Type as PhysicalType};
use parquet::column::writer::ColumnWriter;
use parquet::data_type::ByteArray;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;
use parquet::record::Field;
use parquet::schema::types::Type;
use tracing::{debug, info, warn};

use crate::frame::{Column, ColumnType, Frame, Value};

const SINGLE_FILE: &str = "data.parquet";
const PART_FILE: &str = "part-0.parquet";

#[derive(Debug, Clone)]
pub struct Lake {
    root: PathBuf,
}

impl Lake {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entity_path(&self, entity: &str) -> PathBuf {
        self.root.join(entity)
    }

    /// Writes `frame` for `entity`. With partition columns only the
    /// partitions present in `frame` are replaced; without them the whole
    /// entity is. Returns the number of files written.
    pub fn write(&self, frame: &Frame, entity: &str, partition_columns: &[&str]) -> Result<usize> {
        if frame.is_empty() {
            warn!(entity, "empty frame, skipping lake write");
            return Ok(0);
        }
        let entity_dir = self.entity_path(entity);

        if partition_columns.is_empty() {
            replace_dir(&entity_dir, |tmp| write_parquet(&tmp.join(SINGLE_FILE), frame))
                .with_context(|| format!("write lake entity {entity}"))?;
            info!(entity, rows = frame.len(), "wrote lake entity");
            return Ok(1);
        }

        let partitions = split_partitions(frame, partition_columns)?;
        // An unpartitioned layout left over from an earlier run would shadow
        // the partition tree on read.
        let stale_single = entity_dir.join(SINGLE_FILE);
        if stale_single.exists() {
            fs::remove_file(&stale_single)
                .with_context(|| format!("remove {}", stale_single.display()))?;
        }

        let count = partitions.len();
        for (segments, part) in partitions {
            let mut dir = entity_dir.clone();
            for segment in &segments {
                dir.push(segment);
            }
            replace_dir(&dir, |tmp| write_parquet(&tmp.join(PART_FILE), &part))
                .with_context(|| format!("write lake partition {}", dir.display()))?;
            debug!(entity, partition = %segments.join("/"), rows = part.len(), "wrote partition");
        }
        info!(entity, partitions = count, rows = frame.len(), "wrote lake entity");
        Ok(count)
    }

    /// Reads every parquet file under `entity` back as one frame, or `None`
    /// when the entity has never been written.
    pub fn read(&self, entity: &str) -> Result<Option<Frame>> {
        let entity_dir = self.entity_path(entity);
        if !entity_dir.exists() {
            return Ok(None);
        }
        let mut files = Vec::new();
        collect_parquet_files(&entity_dir, &mut files)?;
        if files.is_empty() {
            return Ok(None);
        }
        let mut frames = Vec::with_capacity(files.len());
        for file in &files {
            frames.push(read_parquet(file)?);
        }
        Ok(Some(Frame::concat(frames)))
    }

    /// Merges `frame` into what the lake already holds for `entity`, keyed by
    /// `key`, and rewrites only the partitions that changed. Re-applying the
    /// same frame leaves the lake content unchanged.
    pub fn merge_write(
        &self,
        frame: &Frame,
        entity: &str,
        key: &[&str],
        partition_columns: &[&str],
    ) -> Result<usize> {
        if frame.is_empty() {
            warn!(entity, "empty frame, skipping lake merge");
            return Ok(0);
        }
        let existing = self.read(entity)?.unwrap_or_default();

        if partition_columns.is_empty() {
            let merged = existing.merge_by_key(frame.clone(), key)?;
            return self.write(&merged, entity, &[]);
        }

        let new_keys = {
            let idx = frame.key_indices(key)?;
            frame
                .rows()
                .iter()
                .map(|r| Frame::row_key(r, &idx))
                .collect::<HashSet<_>>()
        };
        let mut touched = partition_keys(frame, partition_columns)?;
        if !existing.columns().is_empty() {
            let key_idx = existing.key_indices(key)?;
            let part_idx = existing.key_indices(partition_columns)?;
            for row in existing.rows() {
                if new_keys.contains(&Frame::row_key(row, &key_idx)) {
                    touched.insert(Frame::row_key(row, &part_idx));
                }
            }
        }

        let merged = existing.merge_by_key(frame.clone(), key)?;
        let part_idx = merged.key_indices(partition_columns)?;
        let affected = merged.filter(|r| touched.contains(&Frame::row_key(r, &part_idx)));
        let written = self.write(&affected, entity, partition_columns)?;

        // Partitions whose rows all moved elsewhere are left empty by the
        // merge; clear them so they stop contributing on read.
        let still_present = partition_keys(&affected, partition_columns)?;
        for gone in touched.difference(&still_present) {
            let mut dir = self.entity_path(entity);
            for (col, value) in partition_columns.iter().zip(gone) {
                dir.push(partition_segment(col, value));
            }
            if dir.exists() {
                fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
            }
        }
        Ok(written)
    }
}

fn partition_keys(frame: &Frame, partition_columns: &[&str]) -> Result<HashSet<Vec<String>>> {
    let idx = frame.key_indices(partition_columns)?;
    Ok(frame
        .rows()
        .iter()
        .map(|r| Frame::row_key(r, &idx))
        .collect())
}

fn split_partitions(
    frame: &Frame,
    partition_columns: &[&str],
) -> Result<BTreeMap<Vec<String>, Frame>> {
    let idx = frame.key_indices(partition_columns)?;
    let mut out: BTreeMap<Vec<String>, Frame> = BTreeMap::new();
    for row in frame.rows() {
        let segments = partition_columns
            .iter()
            .zip(&idx)
            .map(|(col, i)| partition_segment(col, &row[*i].key_repr()))
            .collect::<Vec<_>>();
        out.entry(segments)
            .or_insert_with(|| Frame::new(frame.columns().to_vec()))
            .push_row(row.clone())?;
    }
    Ok(out)
}

/// `col=value` with the value percent-encoded, so distinct values never
/// share a directory.
fn partition_segment(column: &str, value: &str) -> String {
    format!("{column}={}", urlencoding::encode(value))
}

/// Builds the new content of `target` in a hidden sibling, then swaps it in.
fn replace_dir(target: &Path, build: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid lake path {}", target.display()))?;
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.tmp-{nonce}"));
    let old = parent.join(format!(".{name}.old-{nonce}"));

    fs::create_dir_all(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    if let Err(err) = build(&tmp) {
        let _ = fs::remove_dir_all(&tmp);
        return Err(err);
    }

    if target.exists() {
        fs::rename(target, &old).with_context(|| format!("move aside {}", target.display()))?;
    }
    if let Err(err) = fs::rename(&tmp, target) {
        if old.exists() {
            let _ = fs::rename(&old, target);
        }
        let _ = fs::remove_dir_all(&tmp);
        return Err(err).with_context(|| format!("swap in {}", target.display()));
    }
    if old.exists() {
        fs::remove_dir_all(&old).with_context(|| format!("remove {}", old.display()))?;
    }
    Ok(())
}

fn collect_parquet_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("list {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("list {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_parquet_files(&path, out)?;
        } else if name.ends_with(".parquet") {
            out.push(path);
        }
    }
    Ok(())
}

fn parquet_schema(frame: &Frame) -> Result<Type> {
    let mut fields = Vec::with_capacity(frame.columns().len());
    for col in frame.columns() {
        let physical = match col.kind {
            ColumnType::Int64 => PhysicalType::INT64,
            ColumnType::Float64 => PhysicalType::DOUBLE,
            ColumnType::Utf8 => PhysicalType::BYTE_ARRAY,
            ColumnType::Bool => PhysicalType::BOOLEAN,
        };
        let mut builder =
            Type::primitive_type_builder(&col.name, physical).with_repetition(Repetition::OPTIONAL);
        if col.kind == ColumnType::Utf8 {
            builder = builder.with_logical_type(Some(LogicalType::String));
        }
        let field = builder
            .build()
            .with_context(|| format!("parquet type for column {}", col.name))?;
        fields.push(Arc::new(field));
    }
    Type::group_type_builder("frame")
        .with_fields(fields)
        .build()
        .context("build parquet schema")
}

fn write_parquet(path: &Path, frame: &Frame) -> Result<()> {
    if frame.columns().is_empty() {
        bail!("cannot write a frame without columns to {}", path.display());
    }
    let schema = Arc::new(parquet_schema(frame)?);
    let props = Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build(),
    );
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut writer =
        SerializedFileWriter::new(file, schema, props).context("open parquet writer")?;
    let mut row_group = writer.next_row_group().context("open row group")?;
    let mut idx = 0usize;
    while let Some(mut column) = row_group.next_column().context("open column writer")? {
        write_column(column.untyped(), frame, idx)
            .with_context(|| format!("write column {}", frame.columns()[idx].name))?;
        column.close().context("close column writer")?;
        idx += 1;
    }
    row_group.close().context("close row group")?;
    writer.close().context("finalize parquet file")?;
    Ok(())
}

fn levels<T>(frame: &Frame, idx: usize, pick: impl Fn(&Value) -> Option<T>) -> (Vec<T>, Vec<i16>) {
    let mut values = Vec::with_capacity(frame.len());
    let mut defs = Vec::with_capacity(frame.len());
    for row in frame.rows() {
        match pick(&row[idx]) {
            Some(v) => {
                values.push(v);
                defs.push(1);
            }
            None => defs.push(0),
        }
    }
    (values, defs)
}

fn write_column(writer: &mut ColumnWriter<'_>, frame: &Frame, idx: usize) -> Result<()> {
    match writer {
        ColumnWriter::Int64ColumnWriter(w) => {
            let (values, defs) = levels(frame, idx, |v| match v {
                Value::Int(n) => Some(*n),
                _ => None,
            });
            w.write_batch(&values, Some(&defs), None)?;
        }
        ColumnWriter::DoubleColumnWriter(w) => {
            let (values, defs) = levels(frame, idx, |v| match v {
                Value::Float(n) => Some(*n),
                _ => None,
            });
            w.write_batch(&values, Some(&defs), None)?;
        }
        ColumnWriter::BoolColumnWriter(w) => {
            let (values, defs) = levels(frame, idx, |v| match v {
                Value::Bool(b) => Some(*b),
                _ => None,
            });
            w.write_batch(&values, Some(&defs), None)?;
        }
        ColumnWriter::ByteArrayColumnWriter(w) => {
            let (values, defs) = levels(frame, idx, |v| match v {
                Value::Text(s) => Some(ByteArray::from(s.as_str())),
                _ => None,
            });
            w.write_batch(&values, Some(&defs), None)?;
        }
        _ => bail!("unsupported parquet column writer"),
    }
    Ok(())
}

fn read_parquet(path: &Path) -> Result<Frame> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("open parquet reader {}", path.display()))?;
    let columns = reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .columns()
        .iter()
        .map(|desc| {
            let kind = match desc.physical_type() {
                PhysicalType::INT32 | PhysicalType::INT64 => ColumnType::Int64,
                PhysicalType::FLOAT | PhysicalType::DOUBLE => ColumnType::Float64,
                PhysicalType::BOOLEAN => ColumnType::Bool,
                _ => ColumnType::Utf8,
            };
            Column::new(desc.name(), kind)
        })
        .collect::<Vec<_>>();

    let mut frame = Frame::new(columns);
    let iter = reader
        .get_row_iter(None)
        .with_context(|| format!("iterate rows of {}", path.display()))?;
    for row in iter {
        let row = row.with_context(|| format!("decode row of {}", path.display()))?;
        let values = row
            .get_column_iter()
            .map(|(_, field)| field_to_value(field))
            .collect::<Vec<_>>();
        frame.push_row(values)?;
    }
    Ok(frame)
}

fn field_to_value(field: &Field) -> Value {
    match field {
        Field::Null => Value::Null,
        Field::Bool(b) => Value::Bool(*b),
        Field::Byte(n) => Value::Int(i64::from(*n)),
        Field::Short(n) => Value::Int(i64::from(*n)),
        Field::Int(n) => Value::Int(i64::from(*n)),
        Field::Long(n) => Value::Int(*n),
        Field::Float(n) => Value::Float(f64::from(*n)),
        Field::Double(n) => Value::Float(*n),
        Field::Str(s) => Value::Text(s.clone()),
        Field::Bytes(b) => Value::Text(String::from_utf8_lossy(b.data()).into_owned()),
        other => Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(rows: &[(i64, i64, &str)]) -> Frame {
        let records = rows
            .iter()
            .map(|(no, t, team)| json!({"No": no, "NoTournament": t, "TeamNameA": team}))
            .collect::<Vec<_>>();
        Frame::from_json_records(&records)
    }

    #[test]
    fn read_missing_entity_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let lake = Lake::new(dir.path());
        assert!(lake.read("matches").unwrap().is_none());
    }

    #[test]
    fn unpartitioned_write_replaces_entity() {
        let dir = tempfile::tempdir().unwrap();
        let lake = Lake::new(dir.path());
        lake.write(&matches(&[(1, 10, "A"), (2, 10, "B")]), "tournaments", &[])
            .unwrap();
        lake.write(&matches(&[(3, 11, "C")]), "tournaments", &[]).unwrap();
        let back = lake.read("tournaments").unwrap().unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.value(0, "No"), Some(&Value::Int(3)));
        assert_eq!(back.value(0, "TeamNameA"), Some(&Value::Text("C".into())));
    }

    #[test]
    fn partitioned_write_only_replaces_touched_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let lake = Lake::new(dir.path());
        lake.write(
            &matches(&[(1, 10, "A"), (2, 11, "B")]),
            "matches",
            &["NoTournament"],
        )
        .unwrap();
        assert!(dir.path().join("matches/NoTournament=10").is_dir());

        lake.write(&matches(&[(3, 11, "C")]), "matches", &["NoTournament"])
            .unwrap();
        let back = lake.read("matches").unwrap().unwrap();
        let mut nos = back
            .column_values("No")
            .unwrap()
            .filter_map(Value::as_i64)
            .collect::<Vec<_>>();
        nos.sort_unstable();
        assert_eq!(nos, vec![1, 3]);
    }

    #[test]
    fn merge_write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let lake = Lake::new(dir.path());
        lake.merge_write(&matches(&[(1, 10, "A")]), "details", &["No"], &["NoTournament"])
            .unwrap();
        let batch = matches(&[(2, 10, "B")]);
        lake.merge_write(&batch, "details", &["No"], &["NoTournament"])
            .unwrap();
        lake.merge_write(&batch, "details", &["No"], &["NoTournament"])
            .unwrap();
        let back = lake.read("details").unwrap().unwrap();
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn nulls_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let lake = Lake::new(dir.path());
        let frame = Frame::from_json_records(&[
            json!({"No": 1, "MatchPointsA": null, "Rate": 0.5, "Live": false}),
            json!({"No": 2, "MatchPointsA": 3, "Rate": null, "Live": null}),
        ]);
        lake.write(&frame, "matches", &[]).unwrap();
        let back = lake.read("matches").unwrap().unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn similar_partition_values_get_separate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let lake = Lake::new(dir.path());
        lake.write(&matches(&[(1, 10, "a/b"), (2, 10, "a_b")]), "matches", &["TeamNameA"])
            .unwrap();
        lake.write(&matches(&[(3, 10, "a_b")]), "matches", &["TeamNameA"]).unwrap();

        let back = lake.read("matches").unwrap().unwrap();
        assert_eq!(back.distinct_i64("No"), vec![1, 3]);
        assert!(dir.path().join("matches").join("TeamNameA=a%2Fb").is_dir());
        assert!(dir.path().join("matches").join("TeamNameA=a_b").is_dir());
    }
}
