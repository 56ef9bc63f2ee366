//! Small blocking HTTP helpers: GET/POST/DELETE with fixed-delay retry,
//! gzip decompression, charset-aware text decoding and JSON variants.

pub mod http;

pub use http::{
    HttpClient, Method, NonRetryableError, RequestOptions, RetryPolicy, delete, delete_json, get,
    get_json, post, post_json, request, request_json,
};
