use super::codec::Fields;
use std::sync::atomic::{AtomicU64, Ordering};

static ACTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Correlation id unique within the process: milliseconds since epoch
/// joined with a monotonically increasing counter.
pub fn next_action_id() -> String {
    let seq = ACTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", crate::get_timestamp(), seq)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmiAction {
    name: String,
    action_id: Option<String>,
    fields: Fields,
}

impl AmiAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_id: None,
            fields: Fields::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(key, value);
        self
    }

    pub fn with_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action_id(&self) -> Option<&str> {
        self.action_id.as_deref()
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Stamp a fresh correlation id unless one is already set.
    pub fn ensure_id(&mut self) -> String {
        self.action_id.get_or_insert_with(next_action_id).clone()
    }

    pub fn to_wire(&self) -> String {
        let mut out = format!("Action: {}\r\n", self.name);
        if let Some(id) = &self.action_id {
            out.push_str(&format!("ActionID: {}\r\n", id));
        }
        for (key, value) in self.fields.iter() {
            out.push_str(&format!("{}: {}\r\n", key, value));
        }
        out.push_str("\r\n");
        out
    }

    pub fn login(username: &str, secret: &str) -> Self {
        Self::new("Login")
            .field("Username", username)
            .field("Secret", secret)
    }

    pub fn events(event_mask: &str) -> Self {
        Self::new("Events").field("EventMask", event_mask)
    }

    pub fn logoff() -> Self {
        Self::new("Logoff")
    }

    pub fn hangup(channel: &str, cause: Option<u32>) -> Self {
        let action = Self::new("Hangup").field("Channel", channel);
        match cause {
            Some(cause) => action.field("Cause", cause.to_string()),
            None => action,
        }
    }

    pub fn redirect(channel: &str, exten: &str, context: &str) -> Self {
        Self::new("Redirect")
            .field("Channel", channel)
            .field("Exten", exten)
            .field("Context", context)
            .field("Priority", "1")
    }

    pub fn extension_state(exten: &str, context: &str) -> Self {
        Self::new("ExtensionState")
            .field("Exten", exten)
            .field("Context", context)
    }
}
