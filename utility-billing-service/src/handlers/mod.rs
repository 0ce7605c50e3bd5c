pub mod health;
pub mod statements;

pub use health::{health_check, metrics_handler, readiness_check};
pub use statements::{
    create_statement, delete_statement, get_statement, import_statements, list_statements,
    summarize_history, update_statement,
};
