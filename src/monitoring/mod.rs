/*!
 * Monitoring
 * Structured tracing setup and dispatch spans
 */

mod tracer;

pub use tracer::{
    init_tracing, span_dispatch, span_server_call, CoordinatorSpan, DispatchSpan,
};
