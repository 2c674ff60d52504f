pub mod agent_config_repository;
pub mod daily_usage_repository;
#[cfg(test)]
pub mod mock_db;
pub mod postgres_agent_config_repository;
pub mod postgres_daily_usage_repository;
pub mod postgres_workflow_binding_repository;
pub mod workflow_binding_repository;
