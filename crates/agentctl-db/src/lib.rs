//! Persistence layer for agentctl.
//!
//! Owns the PostgreSQL models, connection pool, embedded migrations, and
//! query modules for the `tasks` and `agent_executions` tables. The
//! orchestration engine (`agentctl-core`) consumes these; it never writes
//! SQL of its own.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
