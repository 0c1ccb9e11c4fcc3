use chat_host::Language;
use clap::Parser;
use std::path::PathBuf;

/// Chat with a locally hosted LLM from the terminal
///
/// Type a message and press enter. `/reset` starts over, `/models` lists
/// what the backend offers, `/quit` exits.
#[derive(Parser, Debug)]
#[command(name = "chat")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration override file (JSON)
    #[arg(short, long, env = "CHATBOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Chat endpoint URL, e.g. http://localhost:11434/api/chat
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Model id to request
    #[arg(short, long)]
    pub model: Option<String>,

    /// Sampling temperature, 0.0 to 1.0
    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// Maximum tokens to generate
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Interface and prompt language (zh or en)
    #[arg(short, long, default_value = "zh")]
    pub language: Language,

    /// Wait for the whole reply instead of streaming it (replies are cached)
    #[arg(long)]
    pub no_stream: bool,

    /// Plain text file to answer questions from
    #[arg(short, long)]
    pub document: Option<PathBuf>,
}
