pub mod envelope;
pub mod health;
pub mod listener;
pub mod notification;
pub mod retry;
