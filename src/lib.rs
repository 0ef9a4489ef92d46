pub mod alerting;
pub mod config;
pub mod controller;
pub mod dashboard;
pub mod error;
pub mod mq;
pub mod node;
pub mod partition;
pub mod periodic;
pub mod repository;
pub mod scheduler;
pub mod shutdown;
pub mod supervisor;
pub(crate) mod sync;
pub mod task_group;
pub mod worker;
