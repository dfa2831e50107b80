use serde_json::{json, Value};

pub fn log_info(component: &str, event: &str, details: Value) {
    eprintln!("{}", log_entry(component, None, event, details));
}

pub fn log_error(component: &str, event: &str, details: Value) {
    eprintln!("{}", log_entry(component, Some("error"), event, details));
}

fn log_entry(component: &str, level: Option<&str>, event: &str, details: Value) -> Value {
    let mut entry = json!({
        "component": component,
        "event": event,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "details": details,
    });
    if let (Some(level), Some(object)) = (level, entry.as_object_mut()) {
        object.insert("level".to_string(), Value::from(level));
    }
    entry
}
