//! The `common` crate contains small, dependency-light utilities shared
//! between the `intercom` transport crate and the `wallet-broker` crate:
//! exponential backoff, graceful shutdown signaling, a joinable task handle,
//! and exact fixed-point decimal conversions for balance math.

/// Exponential backoff.
pub mod backoff;
/// Exact integer-string-to-decimal conversion for balance amounts.
pub mod decimal;
/// `ShutdownChannel`.
pub mod shutdown;
/// `LxTask`.
pub mod task;

/// Assert at compile time that a boolean expression evaluates to true.
/// Implementation copied from the static_assertions crate.
#[macro_export]
macro_rules! const_assert {
    ($x:expr $(,)?) => {
        #[allow(clippy::const_is_empty, clippy::eq_op, unknown_lints)]
        const _: [(); 0 - !{
            const CONST_ASSERT: bool = $x;
            CONST_ASSERT
        } as usize] = [];
    };
}
