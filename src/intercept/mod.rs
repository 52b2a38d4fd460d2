//! Interception layer: arming mutants and rewriting traffic that matches them.
//!
//! A test suite routes its HTTP calls through [`InterceptedTransport`]. When the
//! wrapped context has a mutant armed, calls matching the mutant's endpoint are
//! rewritten on the way out (request operators) or on the way back (response
//! operators); everything else passes through byte for byte.

pub mod context;
pub mod http;
pub mod path;

pub use context::{
    ActivationError, AlreadyArmedError, ArmGuard, ArmReport, CallTicket, INTERCEPT_ENV,
    InterceptionContext, MUTANT_ENV, REPORT_ENV, read_call_log,
};
pub use http::{HttpRequest, HttpResponse, Transport, TransportError};
pub use path::{normalize_path, path_matches_template};

/// Transport middleware applying the armed mutant of a context.
///
/// Without a context (interception not activated) it is a pure pass-through.
#[derive(Debug, Clone)]
pub struct InterceptedTransport<T> {
    inner: T,
    context: Option<InterceptionContext>,
}

impl<T: Transport> InterceptedTransport<T> {
    /// Wrap `inner`; `None` disables interception.
    pub fn new(inner: T, context: Option<InterceptionContext>) -> Self {
        Self { inner, context }
    }

    /// Wrap `inner`, activating from `APIMUTANT_INTERCEPT` / `APIMUTANT_MUTANT`.
    pub fn from_env(inner: T) -> Result<Self, ActivationError> {
        Ok(Self::new(inner, InterceptionContext::from_env()?))
    }

    /// The context in use, if interception is active.
    pub fn context(&self) -> Option<&InterceptionContext> {
        self.context.as_ref()
    }

    /// Unwrap the inner transport.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Transport> Transport for InterceptedTransport<T> {
    fn send(&self, mut request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let Some(context) = &self.context else {
            return self.inner.send(request);
        };
        let ticket = context.intercept_request(&mut request);
        let mut response = self.inner.send(request)?;
        context.intercept_response(&ticket, &mut response);
        Ok(response)
    }
}
