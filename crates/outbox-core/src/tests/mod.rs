//! Integration tests for the outbox engine.
//!
//! Organization:
//!
//! - `harness.rs`      - scriptable mock stream, fault-injecting store,
//!                       poll-until-true assertion helper
//! - `dispatch.rs`     - publish-then-mark flow, failure recovery,
//!                       redelivery after a failed mark, ordering, batching
//! - `cleanup.rs`      - retention cutoff, batch limits, no silent loss
//! - `transactions.rs` - transactional producer path and rollback
//! - `lifecycle.rs`    - builder validation, start/stop, stream closure

mod lifecycle;
