//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                               |
//! |-----------|------------------------------------------------|
//! | `serve`   | `Serve`                                        |
//! | `migrate` | `Migrate`, `Status`, `InitDb`, `Reconcile`     |
//! | `browse`  | `Browse`                                       |

pub mod browse;
pub mod migrate;
pub mod serve;

pub use browse::cmd_browse;
pub use migrate::{cmd_init_db, cmd_migrate, cmd_reconcile, cmd_status};
pub use serve::cmd_serve;
