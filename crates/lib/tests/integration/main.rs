//! End-to-end tests: build files on disk, real rule keys and real steps.

mod builds;
mod common;
mod rule_keys;
