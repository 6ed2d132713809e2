use crate::admission::CommandClass;
use crate::models::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Ask(String),
    Info(String),
    Fx(String),
}

impl Command {
    // `/name[@bot] argument`; unknown commands and plain text are None
    pub fn parse(text: &str, bot_username: &str) -> Option<Self> {
        let text = text.trim();
        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (text, ""),
        };

        let name = head.strip_prefix('/')?;
        let name = match name.split_once('@') {
            // a command addressed to another bot is not ours
            Some((name, target)) if target.eq_ignore_ascii_case(bot_username) => name,
            Some(_) => return None,
            None => name,
        };

        let argument = strip_mention(rest, bot_username);
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Command::Start),
            "ask" => Some(Command::Ask(argument)),
            "info" => Some(Command::Info(argument.to_lowercase())),
            "fx" => Some(Command::Fx(argument.to_lowercase())),
            _ => None,
        }
    }

    pub fn class(&self) -> Option<CommandClass> {
        match self {
            Command::Start | Command::Fx(_) => None,
            Command::Ask(_) => Some(CommandClass::Ask),
            Command::Info(_) => Some(CommandClass::Info),
        }
    }

    pub fn argument(&self) -> &str {
        match self {
            Command::Start => "",
            Command::Ask(arg) | Command::Info(arg) | Command::Fx(arg) => arg,
        }
    }
}

// Group chatter is only ours if it names the bot; private chats always are
pub fn is_addressed(message: &Message, bot_username: &str) -> bool {
    if message.chat.is_private() {
        return true;
    }
    message
        .text
        .as_deref()
        .map(|text| text.split_whitespace().any(|word| names_bot(word, bot_username)))
        .unwrap_or(false)
}

// `@bot` or `/cmd@bot` as a whole word, trailing punctuation allowed
fn names_bot(word: &str, bot_username: &str) -> bool {
    let word = word.trim_end_matches(|c: char| matches!(c, ',' | '.' | '!' | '?' | ':' | ';'));
    match word.split_once('@') {
        Some((prefix, target)) => {
            (prefix.is_empty() || prefix.starts_with('/')) && target.eq_ignore_ascii_case(bot_username)
        }
        None => false,
    }
}

fn strip_mention(text: &str, bot_username: &str) -> String {
    text.split_whitespace()
        .filter(|word| !(word.starts_with('@') && names_bot(word, bot_username)))
        .collect::<Vec<_>>()
        .join(" ")
}

// Drop markdown code fences the model sometimes wraps answers in
pub fn strip_code_fences(text: &str) -> String {
    text.replace("```html", "").replace("```", "").trim().to_string()
}

// Chunks of at most `limit` chars, split at line breaks where possible
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        let hard_end = rest
            .char_indices()
            .nth(limit)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let end = match rest[..hard_end].rfind('\n') {
            Some(idx) if idx > 0 => idx,
            _ => hard_end,
        };
        chunks.push(rest[..end].to_string());
        rest = rest[end..].trim_start_matches('\n');
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}
