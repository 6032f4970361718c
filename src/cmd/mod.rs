//! CLI command implementations.
//!
//! | Module      | Commands handled            |
//! |-------------|-----------------------------|
//! | `serve`     | `Serve`                     |
//! | `project`   | `Init`                      |
//! | `instances` | `List`                      |
//! | `config`    | `Config`                    |

pub mod config;
pub mod instances;
pub mod project;
pub mod serve;

pub use config::cmd_config;
pub use instances::cmd_list;
pub use project::cmd_init;
pub use serve::cmd_serve;
