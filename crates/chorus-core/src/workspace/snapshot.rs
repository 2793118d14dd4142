//! Newline-delimited JSON snapshots of agent state and pending inboxes.
//!
//! One routed-event object per line, oldest tick first, followed by one
//! `{"kind":"state","agent":...,"state":...}` record per agent.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{json, Value};

use crate::agent::AgentSnapshot;
use crate::error::{Error, Result};
use crate::message::Event;

/// Default file name for workspace snapshots.
pub const SNAPSHOT_FILE_NAME: &str = "snapshot.ndjson";

/// Deserialized snapshot contents: undelivered events in tick order plus
/// each agent's committed state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotData {
    pub events: Vec<Event>,
    pub states: BTreeMap<String, Value>,
}

pub(crate) fn write_snapshot(path: &Path, snapshots: &[AgentSnapshot]) -> Result<()> {
    let mut events: Vec<&Event> = snapshots.iter().flat_map(|s| s.pending.iter()).collect();
    events.sort_by_key(|e| e.timestamp());

    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(event)?);
        out.push('\n');
    }
    for snapshot in snapshots {
        let record = json!({
            "kind": "state",
            "agent": snapshot.agent.as_str(),
            "state": snapshot.state,
        });
        out.push_str(&serde_json::to_string(&record)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Read a snapshot file back, preserving event order.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<SnapshotData> {
    let text = std::fs::read_to_string(path)?;
    let mut data = SnapshotData::default();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)?;
        if value.get("kind").and_then(Value::as_str) == Some("state") {
            let agent = value
                .get("agent")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidOperation("state record without agent".into()))?
                .to_string();
            let state = value.get("state").cloned().unwrap_or(Value::Null);
            data.states.insert(agent, state);
        } else {
            data.events.push(serde_json::from_value(value)?);
        }
    }
    Ok(data)
}
