//! Shared library code for integration tests
//!
//! This module contains constants and utilities that are shared between
//! the main test binary and helper binaries like cleanup.

// Unfortunately needed here to work with linkme
#![allow(unsafe_code)]

use linkme::distributed_slice;

/// Prefix of every libvirt object (pool, network) created by integration tests
pub const TEST_RESOURCE_PREFIX: &str = "virtscen-it-";

/// A test function that returns a Result
pub type TestFn = fn() -> color_eyre::Result<()>;

/// Metadata for a registered integration test
#[derive(Debug)]
pub struct IntegrationTest {
    /// Name of the integration test
    pub name: &'static str,
    /// Test function to execute
    pub f: TestFn,
}

impl IntegrationTest {
    /// Create a new integration test with the given name and function
    pub const fn new(name: &'static str, f: TestFn) -> Self {
        Self { name, f }
    }
}

/// Distributed slice holding all registered integration tests
#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register an integration test with less boilerplate.
///
/// This macro generates the static registration for an integration test function.
///
/// # Examples
///
/// ```ignore
/// fn test_basic_functionality() -> Result<()> {
///     let output = run_virtscen(&["list"])?;
///     output.assert_success("list");
///     Ok(())
/// }
/// integration_test!(test_basic_functionality);
/// ```
#[macro_export]
macro_rules! integration_test {
    ($fn_name:ident) => {
        ::paste::paste! {
            #[distributed_slice($crate::INTEGRATION_TESTS)]
            static [<$fn_name:upper>]: $crate::IntegrationTest =
                $crate::IntegrationTest::new(stringify!($fn_name), $fn_name);
        }
    };
}

/// A fresh resource name: the test prefix, `kind`, and a random suffix.
///
/// Names only contain characters libvirt accepts for pools and networks.
pub fn unique_name(kind: &str) -> String {
    use rand::Rng;

    let suffix: u32 = rand::rng().random_range(0..0x100_0000);
    format!("{TEST_RESOURCE_PREFIX}{kind}-{suffix:06x}")
}

/// Whether `name` was created by an integration test.
pub fn is_test_resource(name: &str) -> bool {
    name.starts_with(TEST_RESOURCE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_shape() {
        let name = unique_name("pool");
        assert!(name.starts_with("virtscen-it-pool-"), "{name}");
        assert_eq!(name.len(), "virtscen-it-pool-".len() + 6);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
        assert!(is_test_resource(&name));
    }

    #[test]
    fn test_is_test_resource() {
        assert!(!is_test_resource("default"));
        assert!(!is_test_resource("my-virtscen-it-net"));
    }
}
