use std::sync::Arc;
use tracing::{info, warn};

use crate::admission::{
    Admission, AdmissionDecision, AdmissionPipeline, AdmissionRequest, CommandClass, RejectKind,
};
use crate::command::{self, Command};
use crate::completion::CompletionService;
use crate::config::BotConfig;
use crate::effects::{self, EffectSearch, MAX_EFFECTS};
use crate::error::TransportError;
use crate::metrics::UPDATES_TOTAL;
use crate::models::{CompletionRequest, Message, Update, User};
use crate::transport::{SendOptions, Transport};

// Bot API hard limit per message
const MESSAGE_LIMIT: usize = 4096;

const GREETING: &str = "Hi! Ask me anything with /ask <question>, get a substance card with /info <name>, or user-reported effects with /fx <name>.";
const THINKING: &str = "Thinking...";
const SOMETHING_WRONG: &str = "Sorry, something went wrong. Please try again later.";

fn sorry(what: &str) -> String {
    format!("Sorry, I couldn't fetch the {}. Please try again later.", what)
}

// How one update ended, mostly for tests and logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Ignored,
    Greeted,
    Usage,
    Rejected(RejectKind),
    Answered,
    Failed,
}

pub struct Dispatcher {
    pipeline: AdmissionPipeline,
    bot: Arc<BotConfig>,
    completion: Arc<dyn CompletionService>,
    transport: Arc<dyn Transport>,
    effects: Option<Arc<dyn EffectSearch>>,
}

impl Dispatcher {
    pub fn new(
        pipeline: AdmissionPipeline,
        bot: Arc<BotConfig>,
        completion: Arc<dyn CompletionService>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            pipeline,
            bot,
            completion,
            transport,
            effects: None,
        }
    }

    pub fn with_effects(mut self, search: Arc<dyn EffectSearch>) -> Self {
        self.effects = Some(search);
        self
    }

    pub fn pipeline(&self) -> &AdmissionPipeline {
        &self.pipeline
    }

    pub async fn handle_update(&self, update: Update) -> Handled {
        UPDATES_TOTAL.inc();

        let Some(message) = update.message else {
            return Handled::Ignored;
        };
        let (Some(user), Some(text)) = (message.from.as_ref(), message.text.as_deref()) else {
            return Handled::Ignored;
        };
        let Some(command) = Command::parse(text, &self.bot.bot_username) else {
            return Handled::Ignored;
        };
        // group chatter never reaches the pipeline
        if !command::is_addressed(&message, &self.bot.bot_username) {
            return Handled::Ignored;
        }

        let class = match &command {
            Command::Start => {
                self.reply(&message, GREETING).await;
                return Handled::Greeted;
            }
            _ if command.argument().is_empty() => {
                let usage = match command {
                    Command::Info(_) => "Usage: /info <substance name>",
                    Command::Fx(_) => "Usage: /fx <substance name>",
                    _ => "Usage: /ask <your question>",
                };
                self.reply(&message, usage).await;
                return Handled::Usage;
            }
            // a search lookup, never metered
            Command::Fx(substance) => return self.effects(&message, substance).await,
            Command::Ask(_) => CommandClass::Ask,
            Command::Info(_) => CommandClass::Info,
        };

        let request = AdmissionRequest {
            user_id: user.id,
            chat_id: message.chat.id,
            class,
        };
        match self.pipeline.evaluate(&request).await {
            AdmissionDecision::Reject(rejection) => {
                self.reply(&message, &rejection.message).await;
                Handled::Rejected(rejection.kind)
            }
            AdmissionDecision::Admit(admission) => {
                self.answer(&message, user, &command, &request, &admission).await
            }
        }
    }

    async fn answer(
        &self,
        message: &Message,
        user: &User,
        command: &Command,
        request: &AdmissionRequest,
        admission: &Admission,
    ) -> Handled {
        let chat_id = message.chat.id;
        if let Err(e) = self.transport.send_typing(chat_id).await {
            warn!(chat = chat_id, "Typing indicator failed: {}", e);
        }
        let placeholder = self
            .transport
            .send_message(chat_id, THINKING, SendOptions::reply_to(message.message_id))
            .await
            .ok();

        let completion_request = self.completion_request(command, user.id, chat_id);
        info!(
            user = user.id,
            username = user.username.as_deref().unwrap_or("-"),
            model = %completion_request.model,
            "Asking: `{}`",
            command.argument()
        );

        let outcome = match self.completion.ask(completion_request).await {
            Ok(completion) => {
                // a cached answer cost nothing downstream
                if completion.cached {
                    self.pipeline.refund(request, admission).await;
                }
                let text = command::strip_code_fences(&completion.text);
                match command {
                    Command::Info(name) => {
                        let card = append_section(
                            &format!("{}\n\n{}", name, text),
                            &self.bot.contact_footer,
                        );
                        self.reply_markdown(message, &card).await;
                    }
                    _ => {
                        for chunk in command::split_message(&text, MESSAGE_LIMIT) {
                            self.reply(message, &chunk).await;
                        }
                    }
                }
                Handled::Answered
            }
            Err(e) => {
                warn!(user = user.id, "Completion failed: {}", e);
                self.pipeline.refund(request, admission).await;
                self.reply(message, &sorry("answer")).await;
                Handled::Failed
            }
        };

        if let Some(id) = placeholder {
            if let Err(e) = self.transport.delete_message(chat_id, id).await {
                warn!(chat = chat_id, "Could not delete placeholder: {}", e);
            }
        }
        outcome
    }

    async fn effects(&self, message: &Message, substance: &str) -> Handled {
        let Some(search) = &self.effects else {
            warn!("Effect search is not configured");
            self.reply(message, &sorry("effects")).await;
            return Handled::Failed;
        };

        let chat_id = message.chat.id;
        if let Err(e) = self.transport.send_typing(chat_id).await {
            warn!(chat = chat_id, "Typing indicator failed: {}", e);
        }
        info!(chat = chat_id, "FX: `{}`", substance);

        match search.search(substance, MAX_EFFECTS).await {
            Ok(hits) if hits.is_empty() => {
                self.reply(message, &sorry("effects")).await;
                Handled::Failed
            }
            Ok(hits) => {
                let text = append_section(
                    &effects::format_effects(substance, &hits),
                    &self.bot.contact_footer,
                );
                self.reply_markdown(message, &text).await;
                Handled::Answered
            }
            Err(e) => {
                warn!(chat = chat_id, "Effect search failed: {}", e);
                self.reply(message, SOMETHING_WRONG).await;
                Handled::Failed
            }
        }
    }

    fn completion_request(&self, command: &Command, user_id: i64, chat_id: i64) -> CompletionRequest {
        let (prompt, temperature) = match command {
            Command::Info(name) => (
                append_section(
                    &format!("Write a drug information card for {}.", name),
                    &self.bot.info_suffix,
                ),
                0.0,
            ),
            _ => (append_section(command.argument(), &self.bot.ask_suffix), 0.5),
        };

        CompletionRequest {
            model: self.bot.model_for(user_id, chat_id).to_string(),
            prompt,
            temperature,
            max_tokens: self.bot.max_tokens,
        }
    }

    async fn reply(&self, message: &Message, text: &str) {
        let sent = self
            .transport
            .send_message(message.chat.id, text, SendOptions::reply_to(message.message_id))
            .await;
        if let Err(e) = sent {
            warn!(chat = message.chat.id, "Reply failed: {}", e);
        }
    }

    // Cards go out as Markdown; generated text with unbalanced markup is resent plain
    async fn reply_markdown(&self, message: &Message, text: &str) {
        for chunk in command::split_message(text, MESSAGE_LIMIT) {
            let sent = self
                .transport
                .send_message(
                    message.chat.id,
                    &chunk,
                    SendOptions::markdown_reply_to(message.message_id),
                )
                .await;
            match sent {
                Ok(_) => {}
                Err(TransportError::Api { description, .. }) => {
                    warn!(chat = message.chat.id, "Markdown rejected ({}), sending plain", description);
                    self.reply(message, &chunk).await;
                }
                Err(e) => warn!(chat = message.chat.id, "Reply failed: {}", e),
            }
        }
    }
}

fn append_section(body: &str, section: &str) -> String {
    if section.is_empty() {
        body.to_string()
    } else {
        format!("{}\n\n{}", body, section)
    }
}
