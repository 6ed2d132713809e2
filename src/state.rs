use crate::dispatch::Dispatcher;
// app's shared state

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub webhook_secret: Option<String>, // expected X-Telegram-Bot-Api-Secret-Token
}
