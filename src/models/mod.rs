pub mod activation;
pub mod agent_config;
pub mod usage;
pub mod workflow;
pub mod workflow_binding;
