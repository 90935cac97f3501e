//! Engine-level integration tests and property-based codec tests

mod engine_tests;
