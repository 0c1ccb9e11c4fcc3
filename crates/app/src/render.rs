use chat_host::Renderer;
use std::io::{self, Write};

/// Reply text to stdout as it arrives; notices and errors to stderr.
#[derive(Debug, Default)]
pub struct TerminalRenderer {
    wrote_reply: bool,
}

impl Renderer for TerminalRenderer {
    fn notice(&mut self, text: &str) {
        eprintln!("{}", text);
    }

    fn fragment(&mut self, text: &str) {
        let mut out = io::stdout().lock();
        // A closed stdout only loses output; the turn itself still completes.
        let _ = out.write_all(text.as_bytes()).and_then(|_| out.flush());
        self.wrote_reply = true;
    }

    fn error(&mut self, text: &str) {
        eprintln!("error: {}", text);
    }

    fn finish(&mut self) {
        if std::mem::take(&mut self.wrote_reply) {
            println!();
        }
    }
}
