//! HTTP request handlers organized by functionality

pub mod health;
pub mod intercept;
pub mod sync;
pub mod widgets;

pub use health::health_handler;
pub use intercept::intercept_handler;
pub use sync::{push_blob_handler, register_required_handler, rollover_handler};
pub use widgets::widget_markup_handler;
