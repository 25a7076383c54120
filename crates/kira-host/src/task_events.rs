//! Task lifecycle events layered on top of the generic `entity.*` stream.
//!
//! Tasks carry a status machine (todo → doing → review → done, blocked from
//! anywhere). The Host API emits `task.created` when a task materializes
//! and `task.enter_<status>` whenever a write moves the status, so
//! downstream consumers (timeboxing, review nudges, rollover jobs) can react
//! without diffing entities themselves.

use serde_json::Value;

use kira_bus_core::EventBus;
use kira_types::EntityKind;

use crate::Entity;

fn status_of(entity: &Entity) -> Option<&str> {
    entity
        .metadata
        .get("status")
        .or_else(|| entity.metadata.get("state"))
        .and_then(Value::as_str)
}

fn base_payload(entity: &Entity) -> serde_json::Map<String, Value> {
    let mut payload = serde_json::Map::new();
    payload.insert("task_id".into(), Value::String(entity.id.clone()));
    payload.insert("title".into(), Value::String(entity.title()));
    payload
}

/// Emit `task.created` for a freshly created task.
pub(crate) async fn emit_task_created(bus: &EventBus, entity: &Entity) {
    if entity.kind != EntityKind::Task {
        return;
    }

    let mut payload = base_payload(entity);
    for key in ["priority", "due_date"] {
        if let Some(value) = entity.metadata.get(key) {
            payload.insert(key.to_string(), value.clone());
        }
    }
    bus.publish("task.created", Value::Object(payload)).await;
}

/// Emit `task.enter_<status>` when a write changed the task's status.
pub(crate) async fn emit_status_transition(
    bus: &EventBus,
    entity: &Entity,
    previous_status: Option<&str>,
) {
    if entity.kind != EntityKind::Task {
        return;
    }
    let Some(status) = status_of(entity) else { return };
    if previous_status == Some(status) {
        return;
    }

    let mut payload = base_payload(entity);
    let event_name = match status {
        "doing" => {
            if let Some(hint) = entity.metadata.get("time_hint") {
                payload.insert("time_hint".into(), hint.clone());
            }
            "task.enter_doing"
        }
        "review" => {
            if let Some(reviewer) = entity.metadata.get("reviewer") {
                payload.insert("reviewer".into(), reviewer.clone());
            }
            "task.enter_review"
        }
        "done" => {
            if let Some(done_ts) = entity.metadata.get("done_ts") {
                payload.insert("completed_at".into(), done_ts.clone());
            }
            "task.enter_done"
        }
        "blocked" => {
            if let Some(reason) = entity.metadata.get("blocked_reason") {
                payload.insert("blocked_reason".into(), reason.clone());
            }
            "task.enter_blocked"
        }
        // todo (and aliases) have no dedicated transition event.
        _ => return,
    };

    bus.publish(event_name, Value::Object(payload)).await;
}
