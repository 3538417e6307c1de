//! # Conflux Core
//!
//! Foundational types shared by the Conflux mediation runtime.
//!
//! - [`value`]: property values carried in a message's property bag
//! - [`message`]: the mutable message context passed through mediation
//!
//! ```rust
//! use conflux_core::{MessageContext, Value};
//!
//! let msg = MessageContext::new("getQuote")
//!     .with_property("symbol", "IBM")
//!     .with_payload(Value::Int(42));
//! assert_eq!(msg.property_str("symbol"), Some("IBM"));
//! ```

pub mod message;
pub mod value;

pub use message::{FxIndexMap, MessageContext, SharedMessage};
pub use value::Value;
