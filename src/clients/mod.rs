pub mod codec;
pub mod consumer;
pub mod debounce;
pub mod health;
pub mod publisher;
pub mod rbmq;
pub mod registry;
pub mod topology;
