/// Recommended error type for suite hooks and any code driving a run. Compatible with the hook
/// result types so that `?` can be used to propagate errors.
pub type GustResult<T> = anyhow::Result<T>;

/// Exit code of a run where every selected unit passed.
pub const EXIT_CODE_SUCCESS: i32 = 0;

/// Exit code of a run where provisioning, the protocol or at least one unit failed.
pub const EXIT_CODE_FAILURE: i32 = 1;

/// Exit code reserved for runs that were cancelled by their deadline or by the operator.
pub const EXIT_CODE_CANCELED: i32 = 130;
