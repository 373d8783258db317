//! Test registration for the vmkit integration suite
//!
//! Tests register themselves with [`integration_test!`] and are collected
//! by the harness binary from the [`INTEGRATION_TESTS`] distributed slice.

pub use linkme;
use linkme::distributed_slice;

pub type TestFn = fn() -> color_eyre::Result<()>;

/// A named integration test.
#[derive(Debug)]
pub struct IntegrationTest {
    pub name: &'static str,
    pub f: TestFn,
}

impl IntegrationTest {
    pub const fn new(name: &'static str, f: TestFn) -> Self {
        Self { name, f }
    }
}

#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register a `fn() -> Result<()>` as an integration test.
#[macro_export]
macro_rules! integration_test {
    ($fn_name:ident) => {
        const _: () = {
            #[$crate::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            #[linkme(crate = $crate::linkme)]
            static TEST: $crate::IntegrationTest =
                $crate::IntegrationTest::new(stringify!($fn_name), $fn_name);
        };
    };
}
