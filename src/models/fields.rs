//! One table naming every record field three ways: the camelCase name used
//! on the wire, the snake_case column in the database, and the header used
//! in the flat-file mirror (only for the columns the sheet carries).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMapping {
    pub wire: &'static str,
    pub storage: &'static str,
    pub column: Option<&'static str>,
}

const fn field(wire: &'static str, storage: &'static str, column: Option<&'static str>) -> FieldMapping {
    FieldMapping { wire, storage, column }
}

pub const RECORD_FIELDS: &[FieldMapping] = &[
    field("id", "local_id", None),
    field("peerId", "peer_id", None),
    field("animator", "animator", Some("Animator")),
    field("projectType", "project_type", Some("ProjectType")),
    field("title", "title", Some("Title")),
    field("scene", "scene", Some("Scene")),
    field("shot", "shot", Some("Shot")),
    field("weekCode", "week_code", Some("Week")),
    field("status", "status", Some("Status")),
    field("notes", "notes", Some("Notes")),
    field("lastSyncedAt", "last_synced_at", None),
    field("updatedAt", "updated_at", None),
];

/// Wire name for a mirror header. Matching is case-insensitive and ignores
/// surrounding whitespace, since sheets are edited by hand.
pub fn wire_for_column(column: &str) -> Option<&'static str> {
    let column = column.trim();
    RECORD_FIELDS
        .iter()
        .find(|f| f.column.is_some_and(|c| c.eq_ignore_ascii_case(column)))
        .map(|f| f.wire)
}

/// Mirror headers in their fixed order.
pub fn sheet_columns() -> impl Iterator<Item = &'static str> {
    RECORD_FIELDS.iter().filter_map(|f| f.column)
}

/// Comma-separated storage columns for a SELECT projection.
pub fn select_list() -> String {
    RECORD_FIELDS.iter().map(|f| f.storage).collect::<Vec<_>>().join(", ")
}
