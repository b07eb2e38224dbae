//! Background job queue and cluster event bus for kazari.
//!
//! This crate provides asynchronous coordination on top of `PostgreSQL`,
//! with no external broker:
//!
//! - **Engine**: durable, bounded-concurrency job execution per named queue,
//!   with delayed scheduling, timeouts, and crash recovery
//! - **Orchestrator**: owns the fixed set of named queues, the stalled-job
//!   healthcheck, and two-phase graceful shutdown
//! - **Jobs**: typed payloads for the inbox, pre-delivery, delivery, and
//!   background-task queues
//! - **Pub/Sub**: cluster-wide event replication via `LISTEN`/`NOTIFY`

pub mod engine;
pub mod jobs;
pub mod orchestrator;
pub mod pubsub;

pub use engine::{JobCompletion, JobHandler, JobQueue, QueueControl, QueueOptions};
pub use jobs::*;
pub use orchestrator::{QueueOrchestrator, QueueStatus};
pub use pubsub::{
    EVENT_CHANNEL, EventBus, FilterPayload, ListMembersPayload, NoteInteraction, NotePayload,
    NotificationPayload, StreamingEvent, UserInteraction,
};
