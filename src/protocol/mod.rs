pub mod anthropic;
pub mod mapping;
pub mod openai_chat;
pub mod request;
pub mod response;
pub mod schema;
