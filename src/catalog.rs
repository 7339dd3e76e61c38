//! The ClickUp stream catalog.

use crate::descriptor::{Endpoint, RecordsAt, Registry, StreamDescriptor, StreamKind};
use eyre::Result;

fn array(key: &str) -> RecordsAt {
    RecordsAt::Array(key.to_string())
}

/// Every ClickUp stream, parents before children.
pub fn clickup_streams() -> Vec<StreamDescriptor> {
    vec![
        StreamDescriptor::new("teams", Endpoint::new("/team", array("teams"))),
        StreamDescriptor::new("spaces", Endpoint::new("/team/{team_id}/space", array("spaces")).param("archived", "false"))
            .child_of("teams", "team_id"),
        StreamDescriptor::new("folders", Endpoint::new("/space/{space_id}/folder", array("folders")).param("archived", "false"))
            .child_of("spaces", "space_id"),
        StreamDescriptor::new("folder_lists", Endpoint::new("/folder/{folder_id}/list", array("lists")).param("archived", "false"))
            .child_of("folders", "folder_id"),
        StreamDescriptor::new("folderless_lists", Endpoint::new("/space/{space_id}/list", array("lists")).param("archived", "false"))
            .child_of("spaces", "space_id"),
        StreamDescriptor::new("task_templates", Endpoint::new("/team/{team_id}/taskTemplate", array("templates")).paged())
            .child_of("teams", "team_id"),
        StreamDescriptor::new("goals", Endpoint::new("/team/{team_id}/goal", array("goals")))
            .child_of("teams", "team_id"),
        StreamDescriptor::new("tags", Endpoint::new("/space/{space_id}/tag", array("tags")))
            .child_of("spaces", "space_id")
            .primary_key(&["name", "space_id"]),
        StreamDescriptor::new("shared_hierarchy", Endpoint::new("/team/{team_id}/shared", RecordsAt::Object("shared".into())))
            .child_of("teams", "team_id")
            .primary_key(&["team_id"]),
        StreamDescriptor::new(
            "tasks",
            Endpoint::new("/team/{team_id}/task", array("tasks"))
                .param("include_closed", "true")
                .param("subtasks", "true")
                .param("archived", "false")
                .param("order_by", "updated")
                .param("reverse", "true")
                .paged()
                .since_after("date_updated_gt"),
        )
        .child_of("teams", "team_id")
        .incremental("date_updated")
        .kind(StreamKind::Tasks),
        StreamDescriptor::new("folder_custom_fields", Endpoint::new("/list/{list_id}/field", array("fields")))
            .child_of("folder_lists", "list_id")
            .primary_key(&["id", "list_id"]),
        StreamDescriptor::new("folderless_custom_fields", Endpoint::new("/list/{list_id}/field", array("fields")))
            .child_of("folderless_lists", "list_id")
            .primary_key(&["id", "list_id"]),
        StreamDescriptor::new("time_entries", Endpoint::new("/team/{team_id}/time_entries", array("data")))
            .child_of("teams", "team_id")
            .incremental("at")
            .kind(StreamKind::TimeEntries),
    ]
}

/// The validated ClickUp registry.
pub fn clickup_registry() -> Result<Registry> {
    Registry::new(clickup_streams())
}
