//! Request-hardening primitives shared by the HTTP surface: CSRF origin
//! checks, the open-redirect guard, login lockout, and the auth circuit
//! breaker.

pub mod circuit;
pub mod csrf;
pub mod lockout;
pub mod redirect;

pub use circuit::{auth_circuit, CircuitBreaker, CircuitConfig, CircuitState, CircuitStats};
pub use csrf::{validate_origin, CsrfPolicy, OriginContext};
pub use lockout::{
    check_lockout, check_lockout_guarded, LockoutPolicy, LoginAttemptStore,
    PostgresLoginAttemptStore,
};
pub use redirect::safe_redirect_target;
