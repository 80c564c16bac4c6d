//! Read-only view of the project directory tree:
//! `<root>/<projectType>/<title>/<scene>/<shot>`.

use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

const SHOT_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum StructureError {
	#[error("no structure root configured")]
	NotConfigured,

	#[error("structure root does not exist: {0}")]
	RootNotExists(PathBuf),

	#[error("structure root is not a directory: {0}")]
	RootNotDir(PathBuf),

	#[error("filesystem walk error: {0}")]
	WalkError(#[from] walkdir::Error),

	#[error("walk task failed: {0}")]
	Join(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectTree {
	pub project_types: Vec<Node>,
	/// Entries that are not directories or sit outside the expected depth.
	pub skipped_entries: u64,
}

/// One directory level; shots are leaves with no children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Node {
	pub name: String,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub children: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct StructureProvider {
	root: Option<PathBuf>,
}

impl StructureProvider {
	pub fn new(root: Option<PathBuf>) -> Self {
		StructureProvider { root }
	}

	/// Walk the tree. Blocking I/O runs on the blocking pool.
	pub async fn scan(&self) -> Result<ProjectTree, StructureError> {
		let root = self.root.clone().ok_or(StructureError::NotConfigured)?;
		if !root.exists() {
			return Err(StructureError::RootNotExists(root));
		}
		if !root.is_dir() {
			return Err(StructureError::RootNotDir(root));
		}

		tokio::task::spawn_blocking(move || walk_tree(&root))
			.await
			.map_err(|e| StructureError::Join(e.to_string()))?
	}
}

#[derive(Default)]
struct Level(BTreeMap<String, Level>);

impl Level {
	fn into_nodes(self) -> Vec<Node> {
		self.0.into_iter().map(|(name, level)| Node { name, children: level.into_nodes() }).collect()
	}
}

fn is_hidden(entry: &DirEntry) -> bool {
	entry.depth() > 0 && entry.file_name().to_str().is_some_and(|s| s.starts_with('.'))
}

fn walk_tree(root: &Path) -> Result<ProjectTree, StructureError> {
	let mut tree = Level::default();
	let mut skipped = 0u64;

	let walker = WalkDir::new(root)
		.min_depth(1)
		.max_depth(SHOT_DEPTH)
		.sort_by_file_name()
		.into_iter()
		.filter_entry(|e| !is_hidden(e));

	for entry in walker {
		let entry = match entry {
			Ok(e) => e,
			Err(e) if e.depth() > 0 => {
				tracing::warn!(error = %e, "skipping unreadable entry");
				skipped += 1;
				continue;
			}
			Err(e) => return Err(e.into()),
		};

		if !entry.file_type().is_dir() {
			skipped += 1;
			continue;
		}

		let Ok(relative) = entry.path().strip_prefix(root) else {
			skipped += 1;
			continue;
		};

		let mut level = &mut tree;
		for part in relative.iter() {
			level = level.0.entry(part.to_string_lossy().into_owned()).or_default();
		}
	}

	Ok(ProjectTree { project_types: tree.into_nodes(), skipped_entries: skipped })
}
