// Exchange connectivity entrypoint
pub mod interface; // dry-run-aware facade over rest + mirror + stream
pub mod rest;      // signed REST client with the retry policy
pub mod sign;      // request signing (HMAC + freshness tokens)
pub mod stream;    // realtime table feed
pub mod types;     // wire data model
