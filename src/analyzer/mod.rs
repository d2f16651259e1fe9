//! Batched external analysis
//!
//! - `call`: the model call surface and its request/response types
//! - `http`: OpenAI-compatible HTTP implementation of that surface
//! - `decode`: shared JSON-from-LLM decoding
//! - `retry`: retry + model fallback state machine
//! - `batch`: many items per call, one outcome per item

pub mod batch;
pub mod call;
pub mod decode;
pub mod http;
pub mod retry;

pub use batch::{
    truncate_chars, BatchAnalyzer, BatchResult, BatchRun, BatchSummary, BatchTask, FallbackReason,
    Outcome,
};
pub use call::{CallRequest, CallResponse, CallStatus, ImageInput, ModelClient};
pub use decode::{decode_json, decode_list, extract_json_array, extract_json_object};
pub use http::OpenAiCompatClient;
pub use retry::{
    backoff_delay, call_with_fallback, AttemptRecord, CallFailure, CallState, CallSuccess,
    CallTrace,
};
