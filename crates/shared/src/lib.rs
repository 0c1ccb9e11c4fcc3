pub mod config;

pub mod agent_api {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        System,
        User,
        Assistant,
    }

    impl Role {
        pub fn as_str(&self) -> &'static str {
            match self {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            }
        }
    }

    impl fmt::Display for Role {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub role: Role,
        pub content: String,
    }

    impl ChatMessage {
        pub fn new(role: Role, content: impl Into<String>) -> Self {
            Self {
                role,
                content: content.into(),
            }
        }

        pub fn system(content: impl Into<String>) -> Self {
            Self::new(Role::System, content)
        }

        pub fn user(content: impl Into<String>) -> Self {
            Self::new(Role::User, content)
        }

        pub fn assistant(content: impl Into<String>) -> Self {
            Self::new(Role::Assistant, content)
        }
    }

    /// One incremental piece of a streamed reply.
    ///
    /// Failures are delivered in-band as `Error` so a stream always ends with
    /// a value instead of a fault. Callers that only care about text can use
    /// [`Fragment::text`] and ignore the tag.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Fragment {
        Content(String),
        Error(String),
    }

    impl Fragment {
        pub fn text(&self) -> &str {
            match self {
                Fragment::Content(s) | Fragment::Error(s) => s,
            }
        }

        pub fn is_error(&self) -> bool {
            matches!(self, Fragment::Error(_))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::agent_api::*;

    #[test]
    fn test_message_serializes_lowercase_role() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));

        let back: ChatMessage =
            serde_json::from_str(r#"{"role":"assistant","content":"yo"}"#).unwrap();
        assert_eq!(back.role, Role::Assistant);
    }

    #[test]
    fn test_fragment_text_ignores_kind() {
        let ok = Fragment::Content("a".into());
        let err = Fragment::Error("b".into());
        assert_eq!(ok.text(), "a");
        assert_eq!(err.text(), "b");
        assert!(err.is_error());
        assert!(!ok.is_error());
    }
}
