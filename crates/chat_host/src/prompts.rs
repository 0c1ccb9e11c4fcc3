//! Prompt and notice text, in the two interface languages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Zh,
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Zh => "zh",
            Language::En => "en",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zh" | "zh-cn" | "chinese" => Ok(Language::Zh),
            "en" | "en-us" | "english" => Ok(Language::En),
            other => Err(format!("unsupported language '{}', expected zh or en", other)),
        }
    }
}

const SYSTEM_PROMPT_ZH: &str = "你是一个友好、乐于助人的AI助手。用自然的口语化风格交流，回答简洁清晰（1-3句话）。遵循规则：
1. 积极共情，避免负面表达
2. 不清楚时礼貌询问细节
3. 拒绝回答敏感话题，引导至安全方向
4. 适当使用表情符号（如😊）增加亲和力";

const SYSTEM_PROMPT_EN: &str = "You are a friendly and helpful AI assistant. Use a natural, conversational style and keep answers concise (1-3 sentences). Follow these rules:
1. Be positive and empathetic, avoid negative expressions
2. Politely ask for clarification when unsure
3. Decline to answer sensitive topics and redirect to safe areas
4. Use appropriate emojis (like 😊) to add warmth";

pub fn system_prompt(language: Language) -> &'static str {
    match language {
        Language::Zh => SYSTEM_PROMPT_ZH,
        Language::En => SYSTEM_PROMPT_EN,
    }
}

/// Append the brevity instruction unless the prompt already asks for it
/// up front.
pub fn with_concise_suffix(prompt: String, language: Language) -> String {
    let head: String = prompt.chars().take(50).collect();
    if prompt.contains("简洁") || head.contains("concise") {
        return prompt;
    }
    let suffix = match language {
        Language::Zh => "请尽量回答简洁（1-3句），必要时给出要点。",
        Language::En => "Please keep answers concise (1-3 sentences) and provide key points when necessary.",
    };
    format!("{}\n\n{}", prompt, suffix)
}

pub fn with_emotion_note(prompt: String, language: Language, emotion: &str, response: &str) -> String {
    match language {
        Language::Zh => format!(
            "{}\n\n用户情绪似乎是{}。在回复的开头加上以下情感回应：\n{}",
            prompt, emotion, response
        ),
        Language::En => format!(
            "{}\n\nThe user's emotion seems to be {}. Start your response with this emotional acknowledgement:\n{}",
            prompt, emotion, response
        ),
    }
}

/// Question wrapped with the document it should be answered from.
pub fn document_prompt(language: Language, document: &str, question: &str) -> String {
    match language {
        Language::Zh => format!("根据以下文档内容回答问题：\n\n{}\n\n问题：{}", document, question),
        Language::En => format!(
            "Based on the following document content, answer the question:\n\n{}\n\nQuestion: {}",
            document, question
        ),
    }
}

pub fn busy_notice(language: Language) -> &'static str {
    match language {
        Language::Zh => "正在生成，请稍候再试...",
        Language::En => "AI is still responding, please wait...",
    }
}

pub fn cooldown_notice(language: Language, remaining: Duration) -> String {
    let secs = (remaining.as_secs_f64() * 100.0).round() / 100.0;
    match language {
        Language::Zh => format!("请等待 {} 秒后再发送...", secs),
        Language::En => format!("Please wait {}s before sending another message...", secs),
    }
}

pub fn document_notice(language: Language) -> &'static str {
    match language {
        Language::Zh => "我正在使用文档内容来回答您的问题...",
        Language::En => "I'm using the document content to answer your question...",
    }
}
