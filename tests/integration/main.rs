//! End-to-end tests against the in-memory store and collaborators.

mod concurrency;
mod harness;
mod scenarios;
