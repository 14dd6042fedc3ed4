pub mod consumer;

pub use consumer::{ConsumerConfig, FanoutSink, LoggingFanoutSink, StreamConsumer};
