//! Wire types for the chat backend
use serde::Serialize;

/// Body of `POST /api/chat/compare`. An empty prompt asks the backend
/// to (re)initialize the remote context for `chat_id` without
/// generating anything.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CompareRequest {
    pub prompt: String,
    pub image: Option<String>,
    pub model: String,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl CompareRequest {
    pub fn new(
        prompt: &str,
        image: Option<&str>,
        model: &str,
        chat_id: &str,
        system_prompt: Option<&str>,
    ) -> Self {
        Self {
            prompt: prompt.to_string(),
            image: image.map(str::to_string),
            model: model.to_string(),
            chat_id: chat_id.to_string(),
            system_prompt: system_prompt.map(str::to_string),
        }
    }

    pub fn init(chat_id: &str, model: &str, system_prompt: Option<&str>) -> Self {
        Self::new("", None, model, chat_id, system_prompt)
    }

    pub fn is_init(&self) -> bool {
        self.prompt.is_empty()
    }
}
