//! Built-in reducers.
//!
//! [`TaskReducer`] folds `task.created` / `task.updated` / `task.deleted`
//! events into a `tasks` bucket of the state. Field merging is per-field
//! last-write-wins keyed by `event_ts`, tracked in a `_field_ts` map inside
//! each entity. That makes the fold commutative for independent fields and
//! lets an update arriving before its create materialize the entity; the
//! late create then merges in only fields no newer event has set.

use serde_json::Value;

use kira_dedupe::EventEnvelope;

use crate::{EventReducer, State};

/// Reducer for the task event family.
pub struct TaskReducer;

const BUCKET: &str = "tasks";
const FIELD_TS: &str = "_field_ts";

fn task_id(envelope: &EventEnvelope) -> Option<String> {
    for key in ["task_id", "id", "entity_id"] {
        if let Some(Value::String(id)) = envelope.payload.get(key) {
            return Some(id.clone());
        }
    }
    None
}

fn bucket_mut(state: &mut State) -> &mut serde_json::Map<String, Value> {
    if !state.contains_key(BUCKET) {
        state.insert(BUCKET.to_string(), Value::Object(serde_json::Map::new()));
    }
    state
        .get_mut(BUCKET)
        .and_then(Value::as_object_mut)
        .expect("tasks bucket is an object")
}

fn payload_fields(envelope: &EventEnvelope) -> impl Iterator<Item = (&String, &Value)> {
    envelope
        .payload
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "task_id" | "entity_id"))
}

/// Merge payload fields into the entity under per-field last-write-wins.
/// A field is overwritten only when this event's `event_ts` is at least as
/// new as the one that last wrote it.
fn merge_fields(task: &mut serde_json::Map<String, Value>, envelope: &EventEnvelope) {
    let event_ts = envelope.event_ts.as_str();

    if !task.contains_key(FIELD_TS) {
        task.insert(FIELD_TS.into(), Value::Object(serde_json::Map::new()));
    }

    for (key, value) in payload_fields(envelope) {
        let last_write = task[FIELD_TS]
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("");
        if event_ts >= last_write {
            task.insert(key.clone(), value.clone());
            task[FIELD_TS]
                .as_object_mut()
                .expect("_field_ts is an object")
                .insert(key.clone(), Value::String(event_ts.to_string()));
        }
    }

    let created_newer = task
        .get("created_ts")
        .and_then(Value::as_str)
        .map_or(true, |created| event_ts < created);
    if created_newer {
        task.insert("created_ts".into(), Value::String(event_ts.to_string()));
    }

    let updated_older = task
        .get("updated_ts")
        .and_then(Value::as_str)
        .map_or(true, |updated| event_ts > updated);
    if updated_older {
        task.insert("updated_ts".into(), Value::String(event_ts.to_string()));
    }
}

impl EventReducer for TaskReducer {
    fn apply(&self, mut state: State, envelope: &EventEnvelope) -> State {
        let Some(id) = task_id(envelope) else { return state };
        let tasks = bucket_mut(&mut state);

        match envelope.event_type.as_str() {
            // Create and update share the merge: whichever arrives first
            // materializes the entity, the other folds in on top.
            "task.created" | "task.updated" => {
                let entry = tasks
                    .entry(id.clone())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                let task = entry.as_object_mut().expect("task entry is an object");
                task.insert("id".into(), Value::String(id));
                merge_fields(task, envelope);
            }
            "task.deleted" => {
                tasks.remove(&id);
            }
            _ => {}
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, ts: &str, fields: &[(&str, Value)]) -> EventEnvelope {
        let mut payload: serde_json::Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        payload.insert("task_id".into(), json!("task-001"));
        let mut env = kira_dedupe::create_event_envelope(
            "test", event_type, payload, Some(&format!("{event_type}-{ts}")), None, None,
        );
        env.event_ts = ts.to_string();
        env
    }

    fn task(state: &State) -> &serde_json::Map<String, Value> {
        state["tasks"]["task-001"].as_object().unwrap()
    }

    #[test]
    fn apply_is_idempotent() {
        let reducer = TaskReducer;
        let create = envelope("task.created", "2025-10-08T12:01:00+00:00", &[("title", json!("T"))]);

        let once = reducer.apply(State::new(), &create);
        let twice = reducer.apply(once.clone(), &create);
        assert_eq!(once, twice);

        let update = envelope("task.updated", "2025-10-08T12:02:00+00:00", &[("status", json!("doing"))]);
        let after = reducer.apply(once, &update);
        let after_twice = reducer.apply(after.clone(), &update);
        assert_eq!(after, after_twice);
    }

    #[test]
    fn independent_field_updates_commute() {
        let reducer = TaskReducer;
        let base = reducer.apply(
            State::new(),
            &envelope("task.created", "2025-10-08T12:00:00+00:00", &[("title", json!("T"))]),
        );

        let set_status = envelope("task.updated", "2025-10-08T12:01:00+00:00", &[("status", json!("doing"))]);
        let set_assignee = envelope("task.updated", "2025-10-08T12:02:00+00:00", &[("assignee", json!("ada"))]);

        let ab = reducer.apply(reducer.apply(base.clone(), &set_status), &set_assignee);
        let ba = reducer.apply(reducer.apply(base, &set_assignee), &set_status);
        assert_eq!(ab, ba);
    }

    #[test]
    fn update_before_create_materializes_entity() {
        let reducer = TaskReducer;
        let state = reducer.apply(
            State::new(),
            &envelope("task.updated", "2025-10-08T12:02:00+00:00", &[("status", json!("doing"))]),
        );
        assert_eq!(task(&state)["status"], "doing");
        assert_eq!(task(&state)["id"], "task-001");
    }

    #[test]
    fn late_create_does_not_clobber_newer_updates() {
        let reducer = TaskReducer;
        // An update with a newer timestamp lands first.
        let state = reducer.apply(
            State::new(),
            &envelope(
                "task.updated",
                "2025-10-08T12:02:00+00:00",
                &[("status", json!("doing")), ("title", json!("Edited title"))],
            ),
        );
        // The create (older) arrives afterwards.
        let state = reducer.apply(
            state,
            &envelope(
                "task.created",
                "2025-10-08T12:01:00+00:00",
                &[("title", json!("Original title")), ("priority", json!("high"))],
            ),
        );

        let t = task(&state);
        assert_eq!(t["title"], "Edited title", "newer update wins");
        assert_eq!(t["priority"], "high", "unset fields are merged in");
        assert_eq!(t["status"], "doing");
        assert_eq!(t["created_ts"], "2025-10-08T12:01:00+00:00");
        assert_eq!(t["updated_ts"], "2025-10-08T12:02:00+00:00");
    }

    #[test]
    fn stale_update_is_ignored_per_field() {
        let reducer = TaskReducer;
        let state = reducer.apply(
            State::new(),
            &envelope("task.updated", "2025-10-08T12:05:00+00:00", &[("status", json!("review"))]),
        );
        let state = reducer.apply(
            state,
            &envelope("task.updated", "2025-10-08T12:01:00+00:00", &[("status", json!("doing"))]),
        );
        assert_eq!(task(&state)["status"], "review");
    }

    #[test]
    fn delete_is_idempotent() {
        let reducer = TaskReducer;
        let state = reducer.apply(
            State::new(),
            &envelope("task.created", "2025-10-08T12:00:00+00:00", &[]),
        );
        let deleted = reducer.apply(state, &envelope("task.deleted", "2025-10-08T12:01:00+00:00", &[]));
        assert!(deleted["tasks"].as_object().unwrap().is_empty());
        let deleted_again =
            reducer.apply(deleted.clone(), &envelope("task.deleted", "2025-10-08T12:01:00+00:00", &[]));
        assert_eq!(deleted, deleted_again);
    }

    #[test]
    fn events_without_task_id_are_no_ops() {
        let reducer = TaskReducer;
        let env = kira_dedupe::create_event_envelope(
            "test",
            "task.created",
            serde_json::Map::new(),
            Some("x"),
            None,
            None,
        );
        let state = reducer.apply(State::new(), &env);
        assert!(state.is_empty());
    }
}
