//! Flat-file projection of the record store.
//!
//! The sheet is a JSON document holding a header row and one row of cells
//! per record, so it round-trips through spreadsheet tooling without
//! carrying surrogate ids or sync state.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
	models::{fields, ProductionRecord, RecordFields},
	store::{Origin, RecordStore, StoreError},
};

#[derive(Debug, Error)]
pub enum MirrorError {
	#[error("I/O error on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("malformed sheet: {0}")]
	Format(String),

	#[error("sheet has no {0} column")]
	MissingColumn(&'static str),

	#[error("sheet row {row}: {message}")]
	Row { row: usize, message: String },

	#[error("refusing to import into a store holding {0} record(s)")]
	StoreNotEmpty(usize),

	#[error(transparent)]
	Store(#[from] StoreError),
}

/// A whole-snapshot tabular view of the records.
#[async_trait]
pub trait FlatFileMirror: Send + Sync {
	async fn read_snapshot(&self) -> Result<Vec<RecordFields>, MirrorError>;

	async fn write_snapshot(&self, records: &[ProductionRecord]) -> Result<(), MirrorError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Sheet {
	columns: Vec<String>,
	#[serde(default)]
	rows: Vec<Vec<String>>,
}

/// `FlatFileMirror` backed by a single JSON sheet on disk.
pub struct SheetFile {
	path: PathBuf,
}

impl SheetFile {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		SheetFile { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn io_err(&self, source: std::io::Error) -> MirrorError {
		MirrorError::Io { path: self.path.clone(), source }
	}
}

#[async_trait]
impl FlatFileMirror for SheetFile {
	async fn read_snapshot(&self) -> Result<Vec<RecordFields>, MirrorError> {
		let bytes = tokio::fs::read(&self.path).await.map_err(|e| self.io_err(e))?;
		let sheet: Sheet = serde_json::from_slice(&bytes).map_err(|e| MirrorError::Format(e.to_string()))?;
		parse_sheet(&sheet)
	}

	/// Written to a sibling temp file and renamed into place, so a reader
	/// never sees a partial sheet.
	async fn write_snapshot(&self, records: &[ProductionRecord]) -> Result<(), MirrorError> {
		let sheet = Sheet {
			columns: fields::sheet_columns().map(String::from).collect(),
			rows: records.iter().map(|r| sheet_row(&r.fields)).collect(),
		};
		let body = serde_json::to_vec_pretty(&sheet).map_err(|e| MirrorError::Format(e.to_string()))?;

		if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
			tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_err(e))?;
		}
		let tmp = self.path.with_extension("tmp");
		tokio::fs::write(&tmp, body).await.map_err(|e| self.io_err(e))?;
		tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io_err(e))?;
		Ok(())
	}
}

fn sheet_row(f: &RecordFields) -> Vec<String> {
	vec![
		f.animator.clone(),
		f.project_type.clone(),
		f.title.clone(),
		f.scene.clone(),
		f.shot.clone(),
		f.week_code.to_string(),
		f.status.as_str().to_string(),
		f.notes.clone().unwrap_or_default(),
	]
}

fn parse_sheet(sheet: &Sheet) -> Result<Vec<RecordFields>, MirrorError> {
	let header: Vec<Option<&'static str>> = sheet.columns.iter().map(|c| fields::wire_for_column(c)).collect();
	for column in fields::sheet_columns() {
		let wire = fields::wire_for_column(column);
		if column != "Notes" && !header.contains(&wire) {
			return Err(MirrorError::MissingColumn(column));
		}
	}

	let mut records = Vec::with_capacity(sheet.rows.len());
	for (i, row) in sheet.rows.iter().enumerate() {
		// header is row 1
		let row_number = i + 2;
		if row.iter().all(|c| c.trim().is_empty()) {
			continue;
		}

		let mut object = serde_json::Map::new();
		for (cell, wire) in row.iter().zip(&header) {
			let Some(wire) = wire else { continue };
			let cell = cell.trim();
			if cell.is_empty() {
				continue;
			}
			let value = if *wire == "status" { cell.to_ascii_lowercase() } else { cell.to_string() };
			object.insert(wire.to_string(), serde_json::Value::String(value));
		}

		let fields: RecordFields = serde_json::from_value(serde_json::Value::Object(object))
			.map_err(|e| MirrorError::Row { row: row_number, message: e.to_string() })?;
		fields.validate().map_err(|e| MirrorError::Row { row: row_number, message: e.to_string() })?;
		records.push(fields.normalized());
	}
	Ok(records)
}

/// Rewrite the mirror from the store's current contents.
pub async fn regenerate(store: &RecordStore, mirror: &dyn FlatFileMirror) -> Result<usize, MirrorError> {
	let records = store.get_all().await?;
	mirror.write_snapshot(&records).await?;
	tracing::debug!(records = records.len(), "mirror regenerated");
	Ok(records.len())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
	pub imported: usize,
	/// Rows whose identity key was already taken by an earlier row.
	pub duplicates: usize,
}

/// Seed an empty store from the mirror. Imported records are unsynced.
pub async fn import(store: &RecordStore, mirror: &dyn FlatFileMirror) -> Result<ImportReport, MirrorError> {
	let existing = store.count().await?;
	if existing > 0 {
		return Err(MirrorError::StoreNotEmpty(existing));
	}

	let mut report = ImportReport::default();
	for fields in mirror.read_snapshot().await? {
		match store.insert(fields, Origin::Local).await {
			Ok(_) => report.imported += 1,
			Err(StoreError::Conflict(key)) => {
				tracing::warn!(%key, "duplicate sheet row skipped");
				report.duplicates += 1;
			}
			Err(e) => return Err(e.into()),
		}
	}
	tracing::info!(imported = report.imported, duplicates = report.duplicates, "mirror imported");
	Ok(report)
}
