pub mod engine;
pub mod n8n;
pub mod webhook;
