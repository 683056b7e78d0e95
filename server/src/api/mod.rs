use actix_web::Responder;
use actix_web::web;

use crate::hub::broadcaster::SseStream;

pub mod json_api;
pub mod results_api;
pub mod stream_api;

/// Headers every SSE response carries so proxies pass frames through
/// unbuffered.
pub fn sse_response(stream: SseStream) -> impl Responder {
    stream
        .customize()
        .insert_header(("Cache-Control", "no-cache, no-transform"))
        .insert_header(("Connection", "keep-alive"))
        .insert_header(("X-Accel-Buffering", "no"))
}

pub fn configure_api(cfg: &mut web::ServiceConfig) {
    json_api::configure(cfg);
    stream_api::configure(cfg);
    results_api::configure(cfg);
}
