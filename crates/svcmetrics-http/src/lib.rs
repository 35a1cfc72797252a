pub mod exposition;
pub mod layer;
pub mod observation;
pub mod rpc;

pub use exposition::ExpositionHandler;
pub use layer::{HttpMetricsLayer, HttpMetricsService, HttpRequestMetrics};
pub use observation::RequestObservation;
pub use rpc::{
    BoxRpcHandler, OperationName, RpcCode, RpcHandler, RpcMetrics, RpcStatus, ToRpcCode,
    parse_operation,
};
