//! Workflow engine: instances moving through staged recipes in isolated
//! worktrees, with their agent output streamed to live subscribers.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, start_server)          │
//! │          │ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│    └─ ws.rs   (PushFeed, ping/pong loop)         │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (Orchestrator, per-id locks)   │
//!                       │    │        │            │            │          │
//!                       │    v        v            v            v          │
//!                       │ stage_   worktree.rs  runner.rs   logs/          │
//!                       │ engine   (git)        (agent CLI) (tail+buffer)  │
//!                       │                                       │          │
//!                       │                          broadcaster.rs <┘       │
//!                       │  monitor.rs  (stuck sweep, cleanup janitor)      │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module         | Responsibility                                          |
//! |----------------|---------------------------------------------------------|
//! | `models`       | `WorkflowInstance`, `InstanceStatus`, activity records  |
//! | `db`           | SQLite access via `DbHandle` (`spawn_blocking`)         |
//! | `stage_engine` | `Recipe` parsing and recipe-scoped `advance`            |
//! | `broadcaster`  | `EventBroadcaster`, `ResumingSubscriber`                |
//!
//! ## Typical Flow
//!
//! 1. `POST /api/instances` → `Orchestrator::trigger()` creates the record at
//!    the recipe's first stage and spawns a driver task.
//! 2. The driver provisions `<worktrees>/<id>` on branch `<prefix><id>` from
//!    the local primary branch, then runs each stage through `StageRunner`.
//! 3. The agent appends to `<artifacts>/<id>/<stage>_<suffix>/raw_output.jsonl`;
//!    `LogAggregator` tails it, buffers parsed entries and publishes them.
//! 4. After the last stage the instance is `ready_to_merge` / `completed`;
//!    `POST /api/instances/{id}/merge` integrates it into the primary branch.

pub mod api;
pub mod broadcaster;
pub mod db;
pub mod logs;
pub mod models;
pub mod monitor;
pub mod orchestrator;
pub mod runner;
pub mod server;
pub mod stage_engine;
pub mod worktree;
pub mod ws;
