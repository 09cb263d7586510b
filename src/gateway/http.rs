// Split by concern: router and shared helpers, text/image failover, audio, body pump.
include!("http/core.rs");
include!("http/relay.rs");
include!("http/audio.rs");
include!("http/stream.rs");
