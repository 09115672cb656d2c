// Read access to the `github` context data carried in the job message.

use serde_json::Value;

use crate::worker::AgentJobRequestMessage;

/// The trigger event payload did not have the expected shape.
#[derive(Debug, thiserror::Error)]
pub enum TriggerContextError {
    #[error("github context has no '{0}'")]
    Missing(&'static str),

    #[error("github context field '{0}' is not an object")]
    NotAnObject(&'static str),
}

/// The `github` context as sent by the service (event name, repository,
/// event payload, ...). Fields are looked up on demand.
#[derive(Debug, Clone)]
pub struct GitHubContext {
    data: Value,
}

impl GitHubContext {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn from_message(message: &AgentJobRequestMessage) -> Option<Self> {
        message.context_data.get("github").cloned().map(Self::new)
    }

    pub fn event_name(&self) -> Option<&str> {
        self.data.get("event_name").and_then(Value::as_str)
    }

    pub fn repository(&self) -> Option<&str> {
        self.data.get("repository").and_then(Value::as_str)
    }

    /// `pull_request` and `pull_request_target` are externally triggered.
    pub fn is_pull_request(&self) -> bool {
        matches!(
            self.event_name(),
            Some("pull_request") | Some("pull_request_target")
        )
    }

    /// `event.pull_request.author_association`. A non-string value reads as `None`.
    pub fn author_association(&self) -> Result<Option<&str>, TriggerContextError> {
        Ok(self
            .pull_request()?
            .get("author_association")
            .and_then(Value::as_str))
    }

    /// `event.pull_request.head.user.login`. `head` and `user` must be present;
    /// a missing or non-string login reads as `None`.
    pub fn head_user_login(&self) -> Result<Option<&str>, TriggerContextError> {
        let head = object_field(self.pull_request()?, "head")?;
        let user = object_field(head, "user")?;
        Ok(user.get("login").and_then(Value::as_str))
    }

    fn pull_request(&self) -> Result<&Value, TriggerContextError> {
        let event = object_field(&self.data, "event")?;
        object_field(event, "pull_request")
    }
}

fn object_field<'a>(value: &'a Value, name: &'static str) -> Result<&'a Value, TriggerContextError> {
    let field = value.get(name).ok_or(TriggerContextError::Missing(name))?;
    if field.is_object() {
        Ok(field)
    } else {
        Err(TriggerContextError::NotAnObject(name))
    }
}
