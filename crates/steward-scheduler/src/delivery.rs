//! Delivery instructions — folds a task's delivery config into the prompt so
//! the agent knows where to send the result.

use serde_json::Value;

/// Prompt actually sent to the executor for a task.
///
/// Without a delivery config (or with an empty object) the prompt is returned
/// unchanged. Otherwise a `[Delivery]` paragraph is appended naming the target
/// type and its remaining parameters. Any other JSON value is rendered as
/// compact JSON.
pub fn effective_prompt(prompt: &str, delivery: Option<&Value>) -> String {
    match delivery.and_then(describe) {
        Some(instruction) => format!("{prompt}\n\n[Delivery] {instruction}"),
        None => prompt.to_string(),
    }
}

fn describe(delivery: &Value) -> Option<String> {
    match delivery {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        Value::Object(map) => {
            let target = map
                .get("type")
                .map(render)
                .unwrap_or_else(|| "the configured target".into());
            let params: Vec<String> = map
                .iter()
                .filter(|(key, _)| key.as_str() != "type")
                .map(|(key, value)| format!("{key}: {}", render(value)))
                .collect();
            if params.is_empty() {
                Some(format!("When you are done, deliver the result via {target}."))
            } else {
                Some(format!(
                    "When you are done, deliver the result via {target} ({}).",
                    params.join(", ")
                ))
            }
        }
        other => Some(format!("When you are done, deliver the result via {other}.")),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
