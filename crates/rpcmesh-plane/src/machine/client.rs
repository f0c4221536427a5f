//! Client proxy: turns `client.call("fn", args)` into a routed call.

use std::future::Future;
use std::panic::Location;
use std::sync::Arc;

use tokio::time::{sleep, timeout, Duration};

use rpcmesh_core::error::{ErrorDescriptor, ErrorKind, Result, RpcError};
use rpcmesh_core::protocol::{pack, unpack, Call, Envelope, Frame, FromValue, Value};
use rpcmesh_core::retry::RetryPredictor;

use crate::config::RetrySection;
use crate::machine::context::RpcContext;
use crate::machine::errors::CallSite;

/// When and how often a failed call is re-issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
    pub retry_application_errors: bool,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
            retry_application_errors: false,
        }
    }

    pub fn attempts(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retry_application_errors: false,
        }
    }

    pub fn with_application_errors(mut self) -> Self {
        self.retry_application_errors = true;
        self
    }

    fn should_retry(&self, predictor: &dyn RetryPredictor, desc: &ErrorDescriptor) -> bool {
        match ErrorKind::from_name(&desc.name) {
            Some(ErrorKind::Decryption | ErrorKind::Cancelled) => return false,
            None if !self.retry_application_errors => return false,
            _ => {}
        }
        predictor.classify(&desc.name, &desc.message).retryable
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(s: &RetrySection) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            backoff: Duration::from_millis(s.backoff_ms),
            retry_application_errors: s.retry_application_errors,
        }
    }
}

/// Per-call overrides. Unset fields fall back to the machine config.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub machine_type: Option<String>,
    pub deployment_id: Option<String>,
    pub retry: Option<RetryPolicy>,
}

impl CallOptions {
    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    pub fn machine_type(mut self, mt: impl Into<String>) -> Self {
        self.machine_type = Some(mt.into());
        self
    }

    pub fn deployment(mut self, id: impl Into<String>) -> Self {
        self.deployment_id = Some(id.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Proxy for one remote service.
#[derive(Clone)]
pub struct ServiceClient {
    ctx: RpcContext,
    service: Arc<str>,
}

impl ServiceClient {
    pub(crate) fn new(ctx: RpcContext, service: String) -> Self {
        Self {
            ctx,
            service: Arc::from(service),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Call `function` with the machine's default options.
    ///
    /// Dropping the returned future before it completes cancels the call.
    #[track_caller]
    pub fn call<R>(&self, function: &str, args: Vec<Value>) -> impl Future<Output = Result<R>> + Send + 'static
    where
        R: FromValue + Send + 'static,
    {
        self.call_with(function, args, CallOptions::default())
    }

    #[track_caller]
    pub fn call_with<R>(
        &self,
        function: &str,
        args: Vec<Value>,
        opts: CallOptions,
    ) -> impl Future<Output = Result<R>> + Send + 'static
    where
        R: FromValue + Send + 'static,
    {
        let site = CallSite {
            service: self.service.to_string(),
            function: function.to_string(),
            location: Location::caller(),
        };
        let ctx = self.ctx.clone();
        async move {
            let value = invoke(ctx, &site, args, opts).await?;
            R::from_value(value).map_err(|e| site.attach(e))
        }
    }
}

async fn invoke(ctx: RpcContext, site: &CallSite, args: Vec<Value>, opts: CallOptions) -> Result<Value> {
    let cfg = ctx.config();
    if let Some(mt) = &opts.machine_type {
        if !cfg.machine_types.is_empty() && !cfg.machine_types.contains(mt) {
            let err = RpcError::Routing(format!("machine type {mt} is outside this client's allowed types").into());
            return Err(site.attach(err));
        }
    }
    let policy = opts.retry.unwrap_or_else(|| RetryPolicy::from(&cfg.retry));
    let wait = opts.timeout.unwrap_or_else(|| cfg.call_timeout());

    let crypto = ctx.crypto();
    let envs = args
        .iter()
        .map(|v| pack(v, cfg.crypto.encrypt, Some(&crypto)))
        .collect::<Result<Vec<Envelope>>>()
        .map_err(|e| site.attach(e))?;

    let mut attempt = 1u32;
    loop {
        let call = Call {
            call_id: ctx.inner().ids.next_id(),
            service: site.service.clone(),
            function: site.function.clone(),
            args: envs.clone(),
            machine_type: opts.machine_type.clone(),
            deployment_id: opts.deployment_id.clone(),
        };
        let desc = match invoke_once(&ctx, call, wait).await {
            Ok(env) => return unpack(&env, Some(&ctx.crypto())).map_err(|e| site.attach(e)),
            Err(desc) => desc,
        };

        if attempt < policy.max_attempts && policy.should_retry(ctx.inner().predictor.as_ref(), &desc) {
            tracing::debug!(
                service = %site.service,
                function = %site.function,
                attempt,
                error = %desc.name,
                "retrying call"
            );
            if !policy.backoff.is_zero() {
                sleep(policy.backoff * attempt).await;
            }
            attempt += 1;
            continue;
        }
        return Err(ctx.inner().errors.reconstruct(desc, site));
    }
}

async fn invoke_once(ctx: &RpcContext, call: Call, wait: Duration) -> std::result::Result<Envelope, ErrorDescriptor> {
    if ctx.is_closed() {
        return Err(ErrorDescriptor::runtime(
            ErrorKind::Transport,
            "connection to control plane is closed",
        ));
    }
    let inner = ctx.inner();
    let call_id = call.call_id;
    let mut pending = inner.pending.register(call_id, Some(inner.out_tx.clone()));
    // fail_all may have run since the first check.
    if ctx.is_closed() {
        drop(pending);
        return Err(ErrorDescriptor::runtime(
            ErrorKind::Transport,
            "connection to control plane is closed",
        ));
    }
    if inner.out_tx.send(Frame::Call(call)).await.is_err() {
        return Err(ErrorDescriptor::runtime(ErrorKind::Transport, "outbound queue closed"));
    }

    let waited = timeout(wait, pending.wait()).await;
    match waited {
        Ok(Some(result)) => result.outcome,
        Ok(None) => Err(ErrorDescriptor::runtime(ErrorKind::Transport, "call abandoned")),
        Err(_) => {
            pending.cancel();
            tracing::debug!(call = %call_id, "call timed out");
            Err(ErrorDescriptor::runtime(
                ErrorKind::Timeout,
                format!("no result within {}ms", wait.as_millis()),
            ))
        }
    }
}

/// Declare a typed proxy over [`ServiceClient`]: one method per remote
/// function, arguments converted with `Into<Value>` and the result with
/// [`FromValue`].
///
/// ```ignore
/// rpcmesh_plane::service_client! {
///     pub struct EchoClient for "echo" {
///         fn echo(text: String) -> String;
///     }
/// }
///
/// let echo = EchoClient::new(&ctx);
/// let back = echo.echo("hi".into()).await?;
/// ```
#[macro_export]
macro_rules! service_client {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident for $service:literal {
            $( $(#[$fmeta:meta])* fn $func:ident ( $( $arg:ident : $ty:ty ),* $(,)? ) -> $ret:ty ; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone)]
        $vis struct $name {
            inner: $crate::ServiceClient,
            opts: $crate::CallOptions,
        }

        #[allow(dead_code)]
        impl $name {
            pub const SERVICE: &'static str = $service;

            pub fn new(ctx: &$crate::RpcContext) -> Self {
                Self {
                    inner: ctx.client($service),
                    opts: $crate::CallOptions::default(),
                }
            }

            /// Options applied to every call made through this proxy.
            pub fn with_options(mut self, opts: $crate::CallOptions) -> Self {
                self.opts = opts;
                self
            }

            pub fn untyped(&self) -> &$crate::ServiceClient {
                &self.inner
            }

            $(
                $(#[$fmeta])*
                #[track_caller]
                pub fn $func(
                    &self,
                    $($arg: $ty),*
                ) -> impl ::std::future::Future<Output = $crate::__private::Result<$ret>> + Send + 'static {
                    self.inner.call_with::<$ret>(
                        stringify!($func),
                        vec![$($crate::__private::Value::from($arg)),*],
                        self.opts.clone(),
                    )
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmesh_core::retry::PatternClassifier;

    #[test]
    fn policy_respects_error_kinds() {
        let p = RetryPolicy::attempts(3, Duration::ZERO);
        let c = PatternClassifier;
        assert!(p.should_retry(&c, &ErrorDescriptor::runtime(ErrorKind::Transport, "gone")));
        assert!(!p.should_retry(&c, &ErrorDescriptor::runtime(ErrorKind::Decryption, "try again")));
        assert!(!p.should_retry(&c, &ErrorDescriptor::new("DbError", "connection reset")));
        assert!(p
            .with_application_errors()
            .should_retry(&c, &ErrorDescriptor::new("DbError", "connection reset")));
    }

    #[test]
    fn policy_from_section() {
        let p = RetryPolicy::from(&RetrySection {
            max_attempts: 4,
            backoff_ms: 20,
            retry_application_errors: true,
        });
        assert_eq!(p.max_attempts, 4);
        assert_eq!(p.backoff, Duration::from_millis(20));
        assert!(p.retry_application_errors);
    }
}
