//! Common test utilities for bridge integration tests.

#![allow(dead_code)]

pub mod harness;

pub use harness::{
    generate_test_data, id, test_config, CountingScopes, FakeEngine, ScriptedPicker, TestBridge,
};
