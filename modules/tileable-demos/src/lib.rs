//! Small end-to-end programs built on the tile runtime.

pub mod greeting;
pub mod orchestration;

pub use greeting::{
    run_greeting, showcase, GreetingPayload, GreetingPlugin, GreetingResult, GreetingTile, Showcase,
};
pub use orchestration::{order_flow, order_registry, run_order_pipeline, OrderSummary, Segment};
