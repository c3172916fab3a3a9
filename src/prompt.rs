//! Chat prompt templates.

use serde::{Deserialize, Serialize};

/// One chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Prompt format expected by the base model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTemplate {
    /// `<|im_start|>role\ncontent<|im_end|>`
    #[default]
    ChatMl,
    /// Llama 3 header/eot format.
    Llama3,
    /// `role: content` lines.
    Plain,
}

impl ChatTemplate {
    /// Render messages and open an assistant turn.
    pub fn render(&self, messages: &[ChatMessage]) -> String {
        let mut out = String::new();
        match self {
            ChatTemplate::ChatMl => {
                for m in messages {
                    out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role, m.content));
                }
                out.push_str("<|im_start|>assistant\n");
            }
            ChatTemplate::Llama3 => {
                out.push_str("<|begin_of_text|>");
                for m in messages {
                    out.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        m.role, m.content
                    ));
                }
                out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
            }
            ChatTemplate::Plain => {
                for m in messages {
                    out.push_str(&format!("{}: {}\n", m.role, m.content));
                }
                out.push_str("assistant:");
            }
        }
        out
    }
}

/// Prepend `system_prompt` unless the conversation already has a system turn.
pub fn with_system_prompt(messages: &[ChatMessage], system_prompt: Option<&str>) -> Vec<ChatMessage> {
    match system_prompt {
        Some(prompt) if !messages.iter().any(|m| m.role == "system") => {
            let mut out = Vec::with_capacity(messages.len() + 1);
            out.push(ChatMessage::new("system", prompt));
            out.extend_from_slice(messages);
            out
        }
        _ => messages.to_vec(),
    }
}
