//! Scenario harness for libvirt integration testing.
//!
//! A scenario runs in four phases (setup, action, verify, cleanup) against
//! an external command executor. Every resource it acquires is released in
//! reverse order during cleanup, whatever happened in the earlier phases,
//! and the run ends in a single [`result::ScenarioResult`].

pub mod cmdext;
pub mod config;
pub mod document;
pub mod error;
pub mod executor;
pub mod libvirt_xml;
pub mod report;
pub mod resources;
pub mod result;
pub mod runner;
pub mod scenarios;
pub mod session;
pub mod virsh;
pub mod wait;
pub mod xml_utils;
