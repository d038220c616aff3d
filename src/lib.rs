//! A distributed, at-least-once job queue backed by Redis.
//!
//! # Features
//!
//! - **Distributed Processing**: any number of producers and server processes
//!   share the same queues through a common Redis instance
//! - **Delayed Jobs**: enqueue with a delay; a per-queue scheduler promotes
//!   jobs when due, with a claim protocol that keeps concurrent servers from
//!   double-promoting
//! - **Dead-Letter Handling**: a job gets exactly one execution attempt;
//!   failures are parked in a dead set with the error text, cleaned up after
//!   a retention window, and resubmittable on demand
//! - **Graceful Shutdown**: stopping the server unblocks the fetch loop and
//!   drains in-flight jobs instead of killing them
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use lazyq::{Client, RedisStorage, Server};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = RedisStorage::new("redis://localhost:6379")?;
//!
//!     let client = Client::new(storage.clone());
//!     client.enqueue("emails", "welcome user 42").await?;
//!     client
//!         .enqueue_after("emails", "reminder for user 42", Duration::from_secs(60))
//!         .await?;
//!
//!     let server = Server::new(storage);
//!     server
//!         .register("emails", |payload| async move {
//!             println!("sending: {}", String::from_utf8_lossy(&payload));
//!             Ok(())
//!         })
//!         .await?;
//!
//!     // Runs until server.graceful_stop() is called from another task.
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod job;
pub mod server;
pub mod stats;
pub mod storage;

pub use client::Client;
pub use error::{LazyqError, Result};
pub use job::{DeadJob, JobEnvelope};
pub use server::{HandleFunc, Server, ServerOptions};
pub use stats::{queue_stats, QueueStats};
pub use storage::{MemoryStorage, RedisStorage, Storage};
