pub mod aggregator;
pub mod dispatcher;
pub mod poller;
pub mod prompt;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod validation;
