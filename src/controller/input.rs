use serde_json::{json, Map, Value};

use crate::error::{ControllerError, Result};
use crate::repository::JobRun;

/// Input document handed to a step run: the trigger data, the outputs of
/// its parents, and empty `overrides` / `user_data` sections for replays.
pub fn build_input(job_run: &JobRun, parents: Map<String, Value>) -> Value {
    json!({
        "input": job_run.trigger_data,
        "triggered_by": job_run.triggered_by,
        "parents": parents,
        "overrides": {},
        "user_data": {},
    })
}

/// Merge `data` into the `overrides` section of an existing input document.
/// Keys from `data` win; everything outside `overrides` is kept as is.
pub fn merge_overrides(existing: Option<&Value>, data: Value) -> Result<Value> {
    let Value::Object(new) = data else {
        return Err(ControllerError::InvalidInput(
            "replay input must be a JSON object".to_string(),
        ));
    };

    let mut doc = match existing {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    let overrides = doc
        .entry("overrides")
        .or_insert_with(|| Value::Object(Map::new()));
    if !overrides.is_object() {
        *overrides = Value::Object(Map::new());
    }
    if let Value::Object(overrides) = overrides {
        overrides.extend(new);
    }

    Ok(Value::Object(doc))
}
