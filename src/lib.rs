pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod queue;
pub mod server;
pub mod smtp;
pub mod staging;
pub mod validation;


pub use classifier::{classify, ClassifiedRecipient};
pub use config::Config;
pub use dispatcher::{Dispatcher, Job, JobPayload, JobPriority};
pub use gateway::Gateway;
pub use queue::JobQueue;
pub use server::Server;
