//! # Task Model
//!
//! The durable unit of background work: one row per requested unit, kept
//! after finalization as the audit record.
//!
//! The model owns all task SQL. Status changes never go through plain
//! writes here; the claim query and the transition statements in
//! [`crate::state_machine`] are the only places a status is flipped, and
//! both are guarded single statements.
//!
//! ## Deduplication
//!
//! Every task carries a `unique_key` derived from its type and entity
//! reference. A partial unique index over active rows makes
//! "at most one active task per key" a storage-level invariant; the
//! enqueuer treats a unique violation as "somebody else won the race".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::fmt;

use crate::state_machine::states::TaskStatus;

/// Priority tiers. Plain integers so callers can slot work between tiers.
pub mod priority {
    pub const LOW: i32 = 1;
    pub const NORMAL: i32 = 5;
    pub const HIGH: i32 = 10;
    pub const URGENT: i32 = 20;
}

/// The closed set of work kinds the engine executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskType {
    AddArtist,
    AddAlbum,
    UpdateArtist,
    UpdateAlbum,
    SyncArtist,
    SyncAlbum,
    SyncArtistAlbums,
    SyncAllArtists,
    SyncSingleAlbum,
    DownloadAlbum,
    DownloadSong,
    AssociateArtist,
    AssociateAlbum,
    AutoAssociateTrack,
    AutoAssociateTracks,
    ScanLibrary,
    ProcessLibraryFile,
    AnalyzeAudioQuality,
    AnalyzeExistingTracks,
    RenameFiles,
    FixTrackStatuses,
    FixMatchedTracksWithoutFiles,
    SyncTrackStatuses,
    UpdateAlbumStatuses,
    PluginInstall,
    PluginUninstall,
    PluginEnable,
    PluginDisable,
    PluginUpgrade,
    RemotePluginInstall,
    PluginReferenceChange,
    CacheClear,
    NpmBuild,
}

impl TaskType {
    pub const ALL: [TaskType; 33] = [
        Self::AddArtist,
        Self::AddAlbum,
        Self::UpdateArtist,
        Self::UpdateAlbum,
        Self::SyncArtist,
        Self::SyncAlbum,
        Self::SyncArtistAlbums,
        Self::SyncAllArtists,
        Self::SyncSingleAlbum,
        Self::DownloadAlbum,
        Self::DownloadSong,
        Self::AssociateArtist,
        Self::AssociateAlbum,
        Self::AutoAssociateTrack,
        Self::AutoAssociateTracks,
        Self::ScanLibrary,
        Self::ProcessLibraryFile,
        Self::AnalyzeAudioQuality,
        Self::AnalyzeExistingTracks,
        Self::RenameFiles,
        Self::FixTrackStatuses,
        Self::FixMatchedTracksWithoutFiles,
        Self::SyncTrackStatuses,
        Self::UpdateAlbumStatuses,
        Self::PluginInstall,
        Self::PluginUninstall,
        Self::PluginEnable,
        Self::PluginDisable,
        Self::PluginUpgrade,
        Self::RemotePluginInstall,
        Self::PluginReferenceChange,
        Self::CacheClear,
        Self::NpmBuild,
    ];

    /// Wire name, identical to the persisted column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddArtist => "add_artist",
            Self::AddAlbum => "add_album",
            Self::UpdateArtist => "update_artist",
            Self::UpdateAlbum => "update_album",
            Self::SyncArtist => "sync_artist",
            Self::SyncAlbum => "sync_album",
            Self::SyncArtistAlbums => "sync_artist_albums",
            Self::SyncAllArtists => "sync_all_artists",
            Self::SyncSingleAlbum => "sync_single_album",
            Self::DownloadAlbum => "download_album",
            Self::DownloadSong => "download_song",
            Self::AssociateArtist => "associate_artist",
            Self::AssociateAlbum => "associate_album",
            Self::AutoAssociateTrack => "auto_associate_track",
            Self::AutoAssociateTracks => "auto_associate_tracks",
            Self::ScanLibrary => "scan_library",
            Self::ProcessLibraryFile => "process_library_file",
            Self::AnalyzeAudioQuality => "analyze_audio_quality",
            Self::AnalyzeExistingTracks => "analyze_existing_tracks",
            Self::RenameFiles => "rename_files",
            Self::FixTrackStatuses => "fix_track_statuses",
            Self::FixMatchedTracksWithoutFiles => "fix_matched_tracks_without_files",
            Self::SyncTrackStatuses => "sync_track_statuses",
            Self::UpdateAlbumStatuses => "update_album_statuses",
            Self::PluginInstall => "plugin_install",
            Self::PluginUninstall => "plugin_uninstall",
            Self::PluginEnable => "plugin_enable",
            Self::PluginDisable => "plugin_disable",
            Self::PluginUpgrade => "plugin_upgrade",
            Self::RemotePluginInstall => "remote_plugin_install",
            Self::PluginReferenceChange => "plugin_reference_change",
            Self::CacheClear => "cache_clear",
            Self::NpmBuild => "npm_build",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Invalid task type: {s}"))
    }
}

/// Reference to the catalog entity a task targets. All three identifiers
/// coexist; at least one should be present for entity-scoped work, while
/// singleton kinds (scan all libraries, cache clear) carry none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// External stable identifier (MusicBrainz id).
    pub mbid: Option<String>,
    /// Internal catalog row id.
    pub id: Option<i64>,
    /// Human label, used when no id exists yet (e.g. adding a new artist).
    pub name: Option<String>,
}

impl EntityRef {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_mbid(mbid: impl Into<String>) -> Self {
        Self {
            mbid: Some(mbid.into()),
            ..Self::default()
        }
    }

    pub fn for_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn for_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Best human-readable label for logs.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.mbid.clone())
            .or_else(|| self.id.map(|id| id.to_string()))
            .unwrap_or_else(|| "unqualified".to_string())
    }
}

/// Derive the dedup key for a (type, entity) pair: the most stable
/// identifier present wins; with none, the key is the bare type and at
/// most one unqualified task of that kind can be active.
pub fn derive_unique_key(task_type: TaskType, entity: &EntityRef) -> String {
    if let Some(mbid) = &entity.mbid {
        format!("{task_type}:{mbid}")
    } else if let Some(id) = entity.id {
        format!("{task_type}:id:{id}")
    } else if let Some(name) = &entity.name {
        format!("{task_type}:name:{name}")
    } else {
        task_type.to_string()
    }
}

/// A persisted task row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub entity_mbid: Option<String>,
    pub entity_id: Option<i64>,
    pub entity_name: Option<String>,
    pub metadata: Option<Json<JsonValue>>,
    pub error_message: Option<String>,
    pub priority: i32,
    pub unique_key: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields supplied when enqueuing; everything else is generated.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub entity: EntityRef,
    pub metadata: Option<JsonValue>,
    pub priority: i32,
}

impl NewTask {
    pub fn new(task_type: TaskType, entity: EntityRef) -> Self {
        Self {
            task_type,
            entity,
            metadata: None,
            priority: priority::NORMAL,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Sortable columns for the browse listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSort {
    #[default]
    CreatedAt,
    StartedAt,
    CompletedAt,
    Priority,
    Status,
    TaskType,
}

impl TaskSort {
    fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::StartedAt => "started_at",
            Self::CompletedAt => "completed_at",
            Self::Priority => "priority",
            Self::Status => "status",
            Self::TaskType => "task_type",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Filters for read-only task browsing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub priority: Option<i32>,
    /// Substring match against the entity name.
    pub entity_name_like: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort: TaskSort,
    pub order: SortOrder,
}

/// Offset pagination for listings.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

const TASK_COLUMNS: &str = "id, task_type, status, entity_mbid, entity_id, entity_name, \
     metadata, error_message, priority, unique_key, created_at, started_at, completed_at";

impl Task {
    /// Entity reference of this task.
    pub fn entity(&self) -> EntityRef {
        EntityRef {
            mbid: self.entity_mbid.clone(),
            id: self.entity_id,
            name: self.entity_name.clone(),
        }
    }

    pub fn metadata_value(&self) -> Option<&JsonValue> {
        self.metadata.as_ref().map(|json| &json.0)
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_finalized()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Elapsed execution time in whole seconds: up to `completed_at` for
    /// finalized tasks, up to now while still running. `None` before the
    /// task ever started.
    pub fn duration_secs(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_seconds())
    }

    /// Insert a new `pending` row. Surfaces the unique violation from the
    /// active-key index unchanged so the enqueuer can resolve the race.
    pub async fn insert(pool: &SqlitePool, new_task: &NewTask) -> Result<Task, sqlx::Error> {
        let unique_key = derive_unique_key(new_task.task_type, &new_task.entity);

        let sql = format!(
            "INSERT INTO tasks (task_type, status, entity_mbid, entity_id, entity_name, \
             metadata, priority, unique_key, created_at) \
             VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             RETURNING {TASK_COLUMNS}"
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(new_task.task_type)
            .bind(&new_task.entity.mbid)
            .bind(new_task.entity.id)
            .bind(&new_task.entity.name)
            .bind(new_task.metadata.clone().map(Json))
            .bind(new_task.priority)
            .bind(&unique_key)
            .bind(Utc::now())
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Task>, sqlx::Error> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// The dedup lookup: at most one row can match thanks to the partial
    /// unique index.
    pub async fn find_active_by_unique_key(
        pool: &SqlitePool,
        unique_key: &str,
    ) -> Result<Option<Task>, sqlx::Error> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE unique_key = ?1 AND status IN ('pending', 'running')"
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(unique_key)
            .fetch_optional(pool)
            .await
    }

    /// Atomically claim the best pending task: flip it to `running` and
    /// return it in one statement. Priority descending, then oldest first,
    /// id as the final tie-break. The outer `status = 'pending'` re-check
    /// makes a race loser match nothing, so two workers can never claim
    /// the same row.
    pub async fn claim_next_pending(
        pool: &SqlitePool,
        type_filter: Option<TaskType>,
    ) -> Result<Option<Task>, sqlx::Error> {
        let filter_clause = if type_filter.is_some() {
            " AND task_type = ?2"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE tasks SET status = 'running', started_at = COALESCE(started_at, ?1) \
             WHERE id = (SELECT id FROM tasks WHERE status = 'pending'{filter_clause} \
                         ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1) \
               AND status = 'pending' \
             RETURNING {TASK_COLUMNS}"
        );

        let mut query = sqlx::query_as::<_, Task>(&sql).bind(Utc::now());
        if let Some(task_type) = type_filter {
            query = query.bind(task_type);
        }
        query.fetch_optional(pool).await
    }

    /// Pending tasks in claim order.
    pub async fn find_pending(
        pool: &SqlitePool,
        limit: Option<i64>,
    ) -> Result<Vec<Task>, sqlx::Error> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' \
             ORDER BY priority DESC, created_at ASC, id ASC LIMIT ?1"
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(limit.unwrap_or(i64::MAX))
            .fetch_all(pool)
            .await
    }

    pub async fn find_running(pool: &SqlitePool) -> Result<Vec<Task>, sqlx::Error> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'running' ORDER BY started_at ASC"
        );
        sqlx::query_as::<_, Task>(&sql).fetch_all(pool).await
    }

    /// Raw counts per status for the statistics aggregate.
    pub async fn status_counts(pool: &SqlitePool) -> Result<Vec<(TaskStatus, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (TaskStatus, i64)>(
            "SELECT status, COUNT(*) FROM tasks GROUP BY status",
        )
        .fetch_all(pool)
        .await
    }

    /// Filtered, paginated browse listing.
    pub async fn find_by_filters(
        pool: &SqlitePool,
        filters: &TaskFilters,
        page: Page,
    ) -> Result<Vec<Task>, sqlx::Error> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"));

        if let Some(status) = filters.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(task_type) = filters.task_type {
            builder.push(" AND task_type = ").push_bind(task_type);
        }
        if let Some(priority) = filters.priority {
            builder.push(" AND priority = ").push_bind(priority);
        }
        if let Some(name) = &filters.entity_name_like {
            builder
                .push(" AND entity_name LIKE ")
                .push_bind(format!("%{name}%"));
        }
        if let Some(after) = filters.created_after {
            builder.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filters.created_before {
            builder.push(" AND created_at <= ").push_bind(before);
        }

        // Sort column and direction come from closed enums, never from
        // caller-supplied strings.
        builder.push(format!(
            " ORDER BY {} {}",
            filters.sort.column(),
            filters.order.keyword()
        ));
        if filters.sort != TaskSort::CreatedAt {
            builder.push(", created_at DESC");
        }
        builder.push(" LIMIT ").push_bind(page.limit);
        builder.push(" OFFSET ").push_bind(page.offset);

        builder.build_query_as::<Task>().fetch_all(pool).await
    }

    /// Full task history for one catalog entity, newest first.
    pub async fn find_for_entity(
        pool: &SqlitePool,
        mbid: Option<&str>,
        entity_id: Option<i64>,
    ) -> Result<Vec<Task>, sqlx::Error> {
        match (mbid, entity_id) {
            (Some(mbid), _) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE entity_mbid = ?1 \
                     ORDER BY created_at DESC"
                );
                sqlx::query_as::<_, Task>(&sql)
                    .bind(mbid)
                    .fetch_all(pool)
                    .await
            }
            (None, Some(id)) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE entity_id = ?1 \
                     ORDER BY created_at DESC"
                );
                sqlx::query_as::<_, Task>(&sql)
                    .bind(id)
                    .fetch_all(pool)
                    .await
            }
            (None, None) => Ok(Vec::new()),
        }
    }

    /// Running tasks whose execution started before `cutoff`.
    pub async fn find_stale_running(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>, sqlx::Error> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'running' AND started_at < ?1 ORDER BY started_at ASC"
        );
        sqlx::query_as::<_, Task>(&sql)
            .bind(cutoff)
            .fetch_all(pool)
            .await
    }

    /// Timeout policy: cancel every running task older than `cutoff` in
    /// one guarded statement. Returns the number of tasks cancelled.
    pub async fn cancel_stale_running(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'cancelled', error_message = ?2, \
             completed_at = COALESCE(completed_at, ?3) \
             WHERE status = 'running' AND started_at < ?1",
        )
        .bind(cutoff)
        .bind(message)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Maintenance: delete finalized tasks completed before `cutoff`.
    pub async fn cleanup_finalized_before(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM tasks \
             WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < ?1",
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Replace the metadata payload. Not a status transition; used to
    /// attach handler result data after finalization.
    pub async fn update_metadata(
        pool: &SqlitePool,
        id: i64,
        metadata: &JsonValue,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET metadata = ?2 WHERE id = ?1")
            .bind(id)
            .bind(Json(metadata.clone()))
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_key_prefers_mbid() {
        let entity = EntityRef {
            mbid: Some("b10bbbfc-cf9e-42e0-be17-e2c3e1d2600d".into()),
            id: Some(7),
            name: Some("The Beatles".into()),
        };
        assert_eq!(
            derive_unique_key(TaskType::SyncArtist, &entity),
            "sync_artist:b10bbbfc-cf9e-42e0-be17-e2c3e1d2600d"
        );
    }

    #[test]
    fn unique_key_falls_back_to_id_then_name() {
        let by_id = EntityRef {
            id: Some(7),
            name: Some("The Beatles".into()),
            ..EntityRef::default()
        };
        assert_eq!(
            derive_unique_key(TaskType::SyncArtist, &by_id),
            "sync_artist:id:7"
        );

        let by_name = EntityRef::for_name("The Beatles");
        assert_eq!(
            derive_unique_key(TaskType::SyncArtist, &by_name),
            "sync_artist:name:The Beatles"
        );
    }

    #[test]
    fn unique_key_bare_type_for_singletons() {
        assert_eq!(
            derive_unique_key(TaskType::ScanLibrary, &EntityRef::none()),
            "scan_library"
        );
    }

    #[test]
    fn task_type_wire_names_roundtrip() {
        for task_type in TaskType::ALL {
            let parsed: TaskType = task_type.as_str().parse().unwrap();
            assert_eq!(parsed, task_type);
        }
        assert!("reticulate_splines".parse::<TaskType>().is_err());
    }

    #[test]
    fn duration_uses_completed_at_when_finalized() {
        let started = Utc::now() - chrono::Duration::seconds(100);
        let task = Task {
            id: 1,
            task_type: TaskType::DownloadAlbum,
            status: TaskStatus::Completed,
            entity_mbid: None,
            entity_id: Some(3),
            entity_name: None,
            metadata: None,
            error_message: None,
            priority: priority::NORMAL,
            unique_key: "download_album:id:3".into(),
            created_at: started,
            started_at: Some(started),
            completed_at: Some(started + chrono::Duration::seconds(42)),
        };
        assert_eq!(task.duration_secs(), Some(42));
    }

    #[test]
    fn duration_none_until_started() {
        let task = Task {
            id: 1,
            task_type: TaskType::ScanLibrary,
            status: TaskStatus::Pending,
            entity_mbid: None,
            entity_id: None,
            entity_name: None,
            metadata: None,
            error_message: None,
            priority: priority::LOW,
            unique_key: "scan_library".into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        assert_eq!(task.duration_secs(), None);
    }

    #[test]
    fn priority_tiers_are_ordered() {
        assert!(priority::LOW < priority::NORMAL);
        assert!(priority::NORMAL < priority::HIGH);
        assert!(priority::HIGH < priority::URGENT);
    }
}
