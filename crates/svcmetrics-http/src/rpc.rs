//! RPC server instrumentation.
//!
//! Handlers implement [`RpcHandler`]; [`RpcMetrics::wrap`] returns either the handler itself or
//! a decorator that records `rpc_server_handled_total` and `rpc_server_handling_seconds` keyed
//! by `{service, method, code}`.

use std::{fmt, sync::Arc, time::Instant};

use async_trait::async_trait;
use svcmetrics_common::{context::CallContext, error::Result};
use svcmetrics_registry::MetricRegistry;
use thiserror::Error;

use crate::observation::{RecorderNames, RequestObservation, RequestRecorder};

const UNKNOWN: &str = "unknown";

/// Canonical RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCode {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl RpcCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Canceled => "Canceled",
            Self::Unknown => "Unknown",
            Self::InvalidArgument => "InvalidArgument",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::PermissionDenied => "PermissionDenied",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::Aborted => "Aborted",
            Self::OutOfRange => "OutOfRange",
            Self::Unimplemented => "Unimplemented",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::DataLoss => "DataLoss",
            Self::Unauthenticated => "Unauthenticated",
        }
    }

    /// Maps the numeric wire value; anything out of range is `Unknown`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Canceled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Native RPC error carrying a status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc error: code = {code} desc = {message}")]
pub struct RpcStatus {
    pub code: RpcCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error-to-status mapping. `None` means the error is not a native status and is reported
/// as `Unknown`.
pub trait ToRpcCode {
    fn rpc_code(&self) -> Option<RpcCode>;
}

impl ToRpcCode for RpcStatus {
    fn rpc_code(&self) -> Option<RpcCode> {
        Some(self.code)
    }
}

impl ToRpcCode for anyhow::Error {
    fn rpc_code(&self) -> Option<RpcCode> {
        self.downcast_ref::<RpcStatus>().map(|status| status.code)
    }
}

impl ToRpcCode for Box<dyn std::error::Error + Send + Sync> {
    fn rpc_code(&self) -> Option<RpcCode> {
        self.downcast_ref::<RpcStatus>().map(|status| status.code)
    }
}

pub fn outcome_code<T, E: ToRpcCode>(result: &std::result::Result<T, E>) -> RpcCode {
    match result {
        Ok(_) => RpcCode::Ok,
        Err(err) => err.rpc_code().unwrap_or(RpcCode::Unknown),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationName<'a> {
    pub service: &'a str,
    pub method: &'a str,
}

/// Splits `/package.Service/Method` (leading slash optional) at the last `/`.
/// Missing parts come back as `"unknown"`.
pub fn parse_operation(operation: &str) -> OperationName<'_> {
    let trimmed = operation.strip_prefix('/').unwrap_or(operation);
    let (service, method) = match trimmed.rsplit_once('/') {
        Some((service, method)) => (service, method),
        None => (UNKNOWN, trimmed),
    };

    OperationName {
        service: non_empty_or_unknown(service),
        method: non_empty_or_unknown(method),
    }
}

fn non_empty_or_unknown(value: &str) -> &str {
    if value.is_empty() { UNKNOWN } else { value }
}

#[async_trait]
pub trait RpcHandler: Send + Sync {
    type Request: Send + 'static;
    type Response: Send + 'static;
    type Error: ToRpcCode + Send + 'static;

    async fn call(
        &self,
        ctx: &CallContext,
        request: Self::Request,
    ) -> std::result::Result<Self::Response, Self::Error>;
}

pub type BoxRpcHandler<Req, Resp, E> =
    Arc<dyn RpcHandler<Request = Req, Response = Resp, Error = E>>;

struct RpcRecorder {
    recorder: RequestRecorder,
}

impl RpcRecorder {
    fn register(registry: &MetricRegistry) -> Result<Self> {
        Ok(Self {
            recorder: RequestRecorder::register(
                registry,
                RecorderNames {
                    counter: "rpc_server_handled_total",
                    counter_help: "Total number of RPCs completed on the server",
                    histogram: "rpc_server_handling_seconds",
                    histogram_help: "Duration of RPCs handled by the server in seconds",
                    labels: ["service", "method", "code"],
                },
            )?,
        })
    }

    fn record(&self, observation: &RequestObservation<'_>) {
        self.recorder.record(
            [observation.route, observation.method, observation.outcome],
            observation.duration,
        );
    }
}

/// Register once per registry, then wrap every handler with [`RpcMetrics::wrap`].
#[derive(Clone)]
pub struct RpcMetrics {
    recorder: Option<Arc<RpcRecorder>>,
}

impl RpcMetrics {
    pub fn new(registry: Option<&MetricRegistry>) -> Result<Self> {
        let recorder = registry
            .map(RpcRecorder::register)
            .transpose()?
            .map(Arc::new);
        Ok(Self { recorder })
    }

    pub fn is_enabled(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn wrap<H>(&self, handler: H) -> BoxRpcHandler<H::Request, H::Response, H::Error>
    where
        H: RpcHandler + 'static,
    {
        match &self.recorder {
            None => Arc::new(handler),
            Some(recorder) => Arc::new(InstrumentedRpcHandler {
                inner: handler,
                recorder: Arc::clone(recorder),
            }),
        }
    }
}

struct InstrumentedRpcHandler<H> {
    inner: H,
    recorder: Arc<RpcRecorder>,
}

#[async_trait]
impl<H> RpcHandler for InstrumentedRpcHandler<H>
where
    H: RpcHandler,
{
    type Request = H::Request;
    type Response = H::Response;
    type Error = H::Error;

    async fn call(
        &self,
        ctx: &CallContext,
        request: Self::Request,
    ) -> std::result::Result<Self::Response, Self::Error> {
        let started_at = Instant::now();
        let Some(metadata) = ctx.metadata() else {
            return self.inner.call(ctx, request).await;
        };

        let result = self.inner.call(ctx, request).await;
        let operation = parse_operation(&metadata.operation);
        self.recorder.record(&RequestObservation {
            method: operation.method,
            route: operation.service,
            outcome: outcome_code(&result).as_str(),
            duration: started_at.elapsed(),
        });

        result
    }
}
