//! Store layer: raw-SQL repositories over the shared postgres pool. Every
//! function takes the pool, grabs a connection, and maps rows into the
//! `models` types. The pipeline-critical operations (`actions::claim`,
//! `locks::acquire`, `actions::resolve_dependencies`) are single atomic
//! statements so they are safe across engine processes.

pub mod actions;
pub mod clusters;
pub mod credentials;
pub mod events;
pub mod health;
pub mod locks;
pub mod nodes;
pub mod policies;
pub mod profiles;
pub mod schema;
pub mod triggers;
pub mod webhooks;

use uuid::Uuid;

/// Whitelisted sort columns for list queries. Anything else falls back to
/// creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    CreatedAt,
    UpdatedAt,
    Name,
    Status,
}

impl SortKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created_at" => Some(SortKey::CreatedAt),
            "updated_at" => Some(SortKey::UpdatedAt),
            "name" => Some(SortKey::Name),
            "status" => Some(SortKey::Status),
            _ => None,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            SortKey::CreatedAt => "created_at",
            SortKey::UpdatedAt => "updated_at",
            SortKey::Name => "name",
            SortKey::Status => "status",
        }
    }
}

/// Common list-query shape shared by the entity repositories.
#[derive(Debug, Clone)]
pub struct ListParams {
    pub limit: Option<i64>,
    /// Row id after which to resume, in creation order. Only honored when
    /// sorting by created_at.
    pub marker: Option<Uuid>,
    pub sort_key: SortKey,
    pub descending: bool,
    /// None = no project scoping (admin or project_safe=false).
    pub project: Option<String>,
    pub show_deleted: bool,
}

impl Default for ListParams {
    fn default() -> Self {
        ListParams {
            limit: None,
            marker: None,
            sort_key: SortKey::CreatedAt,
            descending: false,
            project: None,
            show_deleted: false,
        }
    }
}

impl ListParams {
    pub(crate) fn order_clause(&self) -> String {
        format!(
            "ORDER BY {} {}",
            self.sort_key.column(),
            if self.descending { "DESC" } else { "ASC" }
        )
    }
}
