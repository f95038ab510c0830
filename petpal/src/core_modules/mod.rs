pub mod actuation;
pub mod annotate;
pub mod capture_broker;
pub mod detector;
pub mod schedule_clock;
pub mod shared_state;
pub mod stream_hub;
